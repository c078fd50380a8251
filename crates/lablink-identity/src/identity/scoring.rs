//! Scoring of observed identity facts against inventory records.
//!
//! Each signal scores 10 on case-insensitive equality and 5 when one string
//! contains the other.  A record's score is the sum over hostname and unique
//! id; a candidate is accepted at 5 or more.

use super::types::{MatchCandidate, MatchReason};
use lablink_core::{DeviceRecord, Inventory};

pub const EXACT_SCORE: u32 = 10;
pub const PARTIAL_SCORE: u32 = 5;
pub const ACCEPT_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strength {
    Exact,
    Partial,
}

impl Strength {
    pub fn score(&self) -> u32 {
        match self {
            Strength::Exact => EXACT_SCORE,
            Strength::Partial => PARTIAL_SCORE,
        }
    }
}

/// Compare one expected value with one observed value. Empty never matches.
pub fn score_field(expected: &str, observed: &str) -> Option<Strength> {
    let expected = expected.trim().to_lowercase();
    let observed = observed.trim().to_lowercase();
    if expected.is_empty() || observed.is_empty() {
        return None;
    }
    if expected == observed {
        Some(Strength::Exact)
    } else if expected.contains(&observed) || observed.contains(&expected) {
        Some(Strength::Partial)
    } else {
        None
    }
}

/// Hostname strength; a hostname embedding the device id counts as partial.
pub fn hostname_strength(record: &DeviceRecord, observed: &str) -> Option<Strength> {
    score_field(&record.expected_hostname, observed).or_else(|| {
        let id = record.device_id.trim().to_lowercase();
        (!id.is_empty() && observed.to_lowercase().contains(&id)).then_some(Strength::Partial)
    })
}

pub fn unique_id_strength(record: &DeviceRecord, observed: &str) -> Option<Strength> {
    record
        .expected_unique_id
        .as_deref()
        .and_then(|expected| score_field(expected, observed))
}

/// Score one record, `None` when nothing matched.
pub fn score_device(
    record: &DeviceRecord,
    hostname: Option<&str>,
    unique_id: Option<&str>,
) -> Option<MatchCandidate> {
    let mut score = 0;
    let mut reasons = Vec::new();

    if let Some(strength) = hostname.and_then(|h| hostname_strength(record, h)) {
        score += strength.score();
        reasons.push(match strength {
            Strength::Exact => MatchReason::ExactHostnameMatch,
            Strength::Partial => MatchReason::PartialHostnameMatch,
        });
    }
    if let Some(strength) = unique_id.and_then(|u| unique_id_strength(record, u)) {
        score += strength.score();
        reasons.push(match strength {
            Strength::Exact => MatchReason::ExactUidMatch,
            Strength::Partial => MatchReason::PartialUidMatch,
        });
    }

    (score > 0).then(|| MatchCandidate {
        device_id: record.device_id.clone(),
        score,
        reasons,
        friendly_name: record.friendly_name.clone(),
        configured_ip: record.configured_ip.clone(),
    })
}

/// All scoring records, best first; ties go to the lowest device id.
pub fn rank_candidates(
    inventory: &Inventory,
    hostname: Option<&str>,
    unique_id: Option<&str>,
) -> Vec<MatchCandidate> {
    let mut candidates: Vec<MatchCandidate> = inventory
        .devices()
        .filter_map(|record| score_device(record, hostname, unique_id))
        .collect();
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
    candidates
}

pub fn accepted(candidates: &[MatchCandidate]) -> Option<&MatchCandidate> {
    candidates.first().filter(|c| c.score >= ACCEPT_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, hostname: Option<&str>, uid: Option<&str>) -> DeviceRecord {
        let mut record = DeviceRecord::new(id);
        if let Some(h) = hostname {
            record.expected_hostname = h.to_string();
        }
        record.expected_unique_id = uid.map(str::to_string);
        record
    }

    #[test]
    fn test_score_field() {
        assert_eq!(score_field("Sentai-01", "sentai-01"), Some(Strength::Exact));
        assert_eq!(score_field("sentai", "sentai-01"), Some(Strength::Partial));
        assert_eq!(score_field("sentai-01-lab", "sentai-01"), Some(Strength::Partial));
        assert_eq!(score_field("", "sentai"), None);
        assert_eq!(score_field("sentai", "  "), None);
        assert_eq!(score_field("imx93", "sentai"), None);
    }

    #[test]
    fn test_partial_hostname_and_exact_uid_scores_fifteen() {
        let sentai = record("sentai-01", Some("sentai"), Some("ABC123"));
        let candidate = score_device(&sentai, Some("sentai-01"), Some("abc123")).unwrap();
        assert_eq!(candidate.score, 15);
        assert_eq!(
            candidate.reasons,
            vec![MatchReason::PartialHostnameMatch, MatchReason::ExactUidMatch]
        );
    }

    #[test]
    fn test_device_id_inside_hostname_is_partial() {
        let board = record("imx93", Some("carrier"), None);
        let candidate = score_device(&board, Some("lmp-imx93-7f2a"), None).unwrap();
        assert_eq!(candidate.score, 5);
        assert_eq!(candidate.reasons, vec![MatchReason::PartialHostnameMatch]);
    }

    #[test]
    fn test_missing_expected_uid_never_scores() {
        let board = record("imx93", None, None);
        assert!(score_device(&board, Some("unrelated"), Some("ABC123")).is_none());
    }

    #[test]
    fn test_ranking_ties_break_on_device_id() {
        let inventory = Inventory::from_records(vec![
            record("rig-b", Some("rig"), None),
            record("rig-a", Some("rig"), None),
            record("rig-exact", Some("rig-1"), None),
        ]);
        let ranked = rank_candidates(&inventory, Some("rig-1"), None);
        let order: Vec<&str> = ranked.iter().map(|c| c.device_id.as_str()).collect();
        assert_eq!(order, vec!["rig-exact", "rig-a", "rig-b"]);
        assert_eq!(accepted(&ranked).unwrap().device_id, "rig-exact");
    }

    #[test]
    fn test_no_candidates_for_unknown_box() {
        let inventory = Inventory::from_records(vec![record("sentai-01", None, Some("ABC123"))]);
        let ranked = rank_candidates(&inventory, Some("buildroot"), Some("ffee0011"));
        assert!(ranked.is_empty());
        assert!(accepted(&ranked).is_none());
    }
}
