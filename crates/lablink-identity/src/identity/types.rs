use chrono::{DateTime, Utc};
use lablink_core::FailureKind;
use lablink_ssh::ssh::AuthKind;
use serde::{Deserialize, Serialize};

// ===============================
// Probe results
// ===============================

/// Result of one probed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Found(String),
    /// Every strategy ran and none produced a plausible value.
    Empty,
    Failed(FailureKind),
}

impl ProbeOutcome {
    pub fn value(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Found(v) => Some(v.as_str()),
            _ => None,
        }
    }
}

/// Parsed `/etc/os-release`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareInfo {
    pub name: Option<String>,
    pub version: Option<String>,
    pub version_id: Option<String>,
    pub build_id: Option<String>,
    pub pretty_name: Option<String>,
    /// Foundries.io factory name.
    pub factory: Option<String>,
    /// `LMP_FACTORY`.
    pub target: Option<String>,
    pub machine: Option<String>,
}

/// A failure as remembered by the cache and reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedError {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub ip: String,
    pub hostname: ProbeOutcome,
    pub unique_id: ProbeOutcome,
    pub firmware: Option<FirmwareInfo>,
    /// The username of the session used, or of the last failed attempt.
    pub username: String,
    pub auth: Option<AuthKind>,
    /// Set when no session could be established.
    pub error: Option<CachedError>,
}

impl ProbeReport {
    pub fn unreachable(ip: &str, username: &str, error: CachedError) -> Self {
        Self {
            ip: ip.to_string(),
            hostname: ProbeOutcome::Failed(error.kind),
            unique_id: ProbeOutcome::Failed(error.kind),
            firmware: None,
            username: username.to_string(),
            auth: None,
            error: Some(error),
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.value()
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.value()
    }

    /// The failure worth remembering: a session failure, or a command
    /// failure when nothing at all was learned.
    pub fn failure(&self) -> Option<CachedError> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        if self.hostname().is_some() || self.unique_id().is_some() {
            return None;
        }
        match (&self.hostname, &self.unique_id) {
            (ProbeOutcome::Failed(kind), _) | (_, ProbeOutcome::Failed(kind)) => Some(CachedError {
                kind: *kind,
                message: format!("identity probe of {} failed ({})", self.ip, kind),
            }),
            _ => None,
        }
    }
}

// ===============================
// Matching
// ===============================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    ExactHostnameMatch,
    PartialHostnameMatch,
    ExactUidMatch,
    PartialUidMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub device_id: String,
    pub score: u32,
    pub reasons: Vec<MatchReason>,
    pub friendly_name: String,
    pub configured_ip: Option<String>,
}

// ===============================
// Cache
// ===============================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub unique_id: Option<String>,
    #[serde(default)]
    pub resolved_device_id: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub firmware_info: Option<FirmwareInfo>,
    #[serde(default)]
    pub match_candidates: Vec<MatchCandidate>,
    #[serde(default)]
    pub last_error: Option<CachedError>,
    pub cached_at: DateTime<Utc>,
    /// Set by a manual rename; identify then leaves `friendly_name` alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name_updated: Option<DateTime<Utc>>,
}

fn filled(value: &Option<String>) -> bool {
    value.as_deref().map_or(false, |v| !v.trim().is_empty())
}

impl CacheEntry {
    pub fn new(ip: &str, now: DateTime<Utc>) -> Self {
        Self {
            ip: ip.to_string(),
            hostname: None,
            unique_id: None,
            resolved_device_id: None,
            friendly_name: None,
            firmware_info: None,
            match_candidates: Vec::new(),
            last_error: None,
            cached_at: now,
            friendly_name_updated: None,
        }
    }

    pub fn identity_established(&self) -> bool {
        filled(&self.hostname) || filled(&self.resolved_device_id)
    }

    /// An entry that records nothing but a failure.
    pub fn error_only(&self) -> bool {
        self.last_error.is_some() && !self.identity_established()
    }
}

/// A partial write into the cache. `None` leaves a field as it is.
///
/// `match_candidates` and `resolved_device_id` are one unit: when candidates
/// are present both are replaced, so an unresolved identify clears an older
/// resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheUpdate {
    pub hostname: Option<String>,
    pub unique_id: Option<String>,
    pub resolved_device_id: Option<String>,
    pub friendly_name: Option<String>,
    pub firmware_info: Option<FirmwareInfo>,
    pub match_candidates: Option<Vec<MatchCandidate>>,
    pub error: Option<CachedError>,
}

impl CacheUpdate {
    pub fn error(error: CachedError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }

    pub fn establishes_identity(&self) -> bool {
        filled(&self.hostname) || filled(&self.resolved_device_id)
    }
}

// ===============================
// Resolver results
// ===============================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSource {
    Cache,
    Inventory,
}

/// Where to reach a device right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub device_id: String,
    pub friendly_name: String,
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub device_class: Option<String>,
    pub source: AddressSource,
    /// Username of a cached credential for the device or address, if any.
    pub credential_username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub ip: String,
    pub resolved_device_id: Option<String>,
    pub friendly_name: Option<String>,
    pub candidates: Vec<MatchCandidate>,
    pub hostname: Option<String>,
    pub unique_id: Option<String>,
    pub firmware: Option<FirmwareInfo>,
    pub error: Option<CachedError>,
    pub from_cache: bool,
}

impl Identification {
    pub fn from_entry(entry: &CacheEntry) -> Self {
        Self {
            ip: entry.ip.clone(),
            resolved_device_id: entry.resolved_device_id.clone(),
            friendly_name: entry.friendly_name.clone(),
            candidates: entry.match_candidates.clone(),
            hostname: entry.hostname.clone(),
            unique_id: entry.unique_id.clone(),
            firmware: entry.firmware_info.clone(),
            error: entry.last_error.clone(),
            from_cache: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub device_id: String,
    pub friendly_name: String,
    pub ip_checked: String,
    pub configured_ip: Option<String>,
    pub ip_matches: bool,
    pub expected_hostname: String,
    pub expected_unique_id: Option<String>,
    pub actual_hostname: Option<String>,
    pub actual_unique_id: Option<String>,
    pub hostname_matches: bool,
    pub unique_id_matches: bool,
    pub verified: bool,
    pub username: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CachedError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpUpdate {
    pub success: bool,
    pub updated: bool,
    pub device_id: String,
    pub old_ip: Option<String>,
    pub new_ip: String,
    pub message: String,
    pub verification: VerificationResult,
}
