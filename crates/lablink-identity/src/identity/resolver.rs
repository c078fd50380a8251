// ── Identity resolver – inventory + cache + probe ────────────────────────────

use super::cache::IdentityCache;
use super::probe::{IdentityProber, ProbeTarget};
use super::scoring::{accepted, hostname_strength, rank_candidates, unique_id_strength};
use super::types::*;
use lablink_core::{DeviceRecord, InventoryStore, LabError};
use lablink_credentials::{CredentialKind, CredentialLookup};
use std::sync::Arc;

pub struct IdentityResolver {
    inventory: Arc<InventoryStore>,
    cache: Arc<IdentityCache>,
    prober: Arc<dyn IdentityProber>,
    credentials: Arc<dyn CredentialLookup>,
}

impl IdentityResolver {
    pub fn new(
        inventory: Arc<InventoryStore>,
        cache: Arc<IdentityCache>,
        prober: Arc<dyn IdentityProber>,
        credentials: Arc<dyn CredentialLookup>,
    ) -> Self {
        Self {
            inventory,
            cache,
            prober,
            credentials,
        }
    }

    pub fn inventory(&self) -> &InventoryStore {
        &self.inventory
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Current address of a device: the freshest cache entry resolved to it,
    /// else the configured IP.
    fn address_of(&self, record: &DeviceRecord) -> Option<(String, AddressSource)> {
        if let Some(entry) = self.cache.find_by_device(&record.device_id) {
            return Some((entry.ip, AddressSource::Cache));
        }
        record
            .configured_ip
            .clone()
            .map(|ip| (ip, AddressSource::Inventory))
    }

    pub fn resolve(&self, reference: &str) -> Result<Resolution, LabError> {
        let record = self.inventory.resolve(reference)?;
        let (ip, source) = self.address_of(&record).ok_or_else(|| {
            LabError::InvalidRequest(format!(
                "device '{}' has no configured IP and no cached address",
                record.device_id
            ))
        })?;

        let credential_username = self
            .credentials
            .get_credential(&record.device_id, CredentialKind::Ssh)
            .or_else(|| self.credentials.get_credential(&ip, CredentialKind::Ssh))
            .map(|c| c.username);

        log::debug!("Resolved {} -> {} ({:?})", reference, ip, source);
        Ok(Resolution {
            device_id: record.device_id,
            friendly_name: record.friendly_name,
            ip,
            port: record.ssh_port,
            username: record.ssh_user,
            device_class: record.device_class,
            source,
            credential_username,
        })
    }

    /// Probe `ip`, score what it reports against the inventory and cache the
    /// result whether or not a device was resolved.
    pub fn identify(&self, ip: &str, username: &str, port: u16) -> Result<Identification, LabError> {
        let report = self.prober.probe(&ProbeTarget::address(ip, username, port));

        if let Some(error) = report.error.clone() {
            self.cache.merge(ip, CacheUpdate::error(error.clone()))?;
            return Ok(Identification {
                ip: ip.to_string(),
                resolved_device_id: None,
                friendly_name: None,
                candidates: Vec::new(),
                hostname: None,
                unique_id: None,
                firmware: None,
                error: Some(error),
                from_cache: false,
            });
        }

        let (update, candidates) = self.facts_update(&report, None);
        let resolved = update.resolved_device_id.clone();
        let entry = self.cache.merge(ip, update)?;

        match resolved.as_deref() {
            Some(id) => log::info!("{} identified as {}", ip, id),
            None => log::info!(
                "{} not matched to any inventory device ({} candidate(s))",
                ip,
                candidates.len()
            ),
        }

        Ok(Identification {
            ip: ip.to_string(),
            resolved_device_id: resolved,
            friendly_name: entry.friendly_name,
            candidates,
            hostname: report.hostname().map(str::to_string),
            unique_id: report.unique_id().map(str::to_string),
            firmware: report.firmware.clone(),
            error: report.failure(),
            from_cache: false,
        })
    }

    /// A fresh cache entry when there is one worth trusting, else a probe.
    pub fn identify_cached(
        &self,
        ip: &str,
        username: &str,
        port: u16,
    ) -> Result<Identification, LabError> {
        match self.cache.get(ip) {
            Some(entry) if !entry.error_only() => Ok(Identification::from_entry(&entry)),
            _ => self.identify(ip, username, port),
        }
    }

    /// Cache update for a reachable probe.  `verified_as` forces the
    /// resolution to a device whose identity was just confirmed.
    fn facts_update(
        &self,
        report: &ProbeReport,
        verified_as: Option<&DeviceRecord>,
    ) -> (CacheUpdate, Vec<MatchCandidate>) {
        let inventory = self.inventory.snapshot();
        let candidates = rank_candidates(&inventory, report.hostname(), report.unique_id());

        let (resolved_device_id, friendly_name) = match verified_as {
            Some(record) => (
                Some(record.device_id.clone()),
                Some(record.friendly_name.clone()),
            ),
            None => match accepted(&candidates) {
                Some(top) => (Some(top.device_id.clone()), Some(top.friendly_name.clone())),
                None => (None, None),
            },
        };

        let update = CacheUpdate {
            hostname: report.hostname().map(str::to_string),
            unique_id: report.unique_id().map(str::to_string),
            resolved_device_id,
            friendly_name,
            firmware_info: report.firmware.clone(),
            match_candidates: Some(candidates.clone()),
            error: report.failure(),
        };
        (update, candidates)
    }

    /// Check that the unit answering at `ip` (default: its current address)
    /// is the inventory device `reference`.
    pub fn verify(&self, reference: &str, ip: Option<&str>) -> Result<VerificationResult, LabError> {
        let record = self.inventory.resolve(reference)?;
        let ip_checked = match ip {
            Some(ip) => ip.to_string(),
            None => self
                .address_of(&record)
                .map(|(ip, _)| ip)
                .ok_or_else(|| {
                    LabError::InvalidRequest(format!(
                        "no IP given and device '{}' has none configured",
                        record.device_id
                    ))
                })?,
        };

        let report = self.prober.probe(&ProbeTarget {
            ip: ip_checked.clone(),
            port: record.ssh_port,
            username: record.ssh_user.clone(),
            device_id: Some(record.device_id.clone()),
            device_class: record.device_class.clone(),
        });

        let hostname_matches = report
            .hostname()
            .map_or(false, |h| hostname_strength(&record, h).is_some());
        let unique_id_matches = report
            .unique_id()
            .map_or(false, |u| unique_id_strength(&record, u).is_some());
        let verified = report.error.is_none() && (hostname_matches || unique_id_matches);
        let ip_matches = record.configured_ip.as_deref() == Some(ip_checked.as_str());

        match &report.error {
            Some(error) => {
                self.cache.merge(&ip_checked, CacheUpdate::error(error.clone()))?;
            }
            None => {
                let (update, _) = self.facts_update(&report, verified.then_some(&record));
                self.cache.merge(&ip_checked, update)?;
            }
        }

        let suggestion = match record.configured_ip.as_deref() {
            Some(configured) if verified && !ip_matches => Some(format!(
                "Device verified but IP changed. Consider updating config: {} -> {}",
                configured, ip_checked
            )),
            _ => None,
        };

        if verified {
            log::info!("Verified {} at {}", record.device_id, ip_checked);
        } else {
            log::warn!(
                "Verification of {} at {} failed (hostname {:?}, uid {:?})",
                record.device_id,
                ip_checked,
                report.hostname(),
                report.unique_id()
            );
        }

        Ok(VerificationResult {
            device_id: record.device_id,
            friendly_name: record.friendly_name,
            ip_checked,
            configured_ip: record.configured_ip,
            ip_matches,
            expected_hostname: record.expected_hostname,
            expected_unique_id: record.expected_unique_id,
            actual_hostname: report.hostname().map(str::to_string),
            actual_unique_id: report.unique_id().map(str::to_string),
            hostname_matches,
            unique_id_matches,
            verified,
            username: report.username.clone(),
            suggestion,
            error: report.failure(),
        })
    }

    /// Rewrite the configured IP of `reference` only after the unit at
    /// `new_ip` has been verified to be that device.
    pub fn update_ip_if_verified(&self, reference: &str, new_ip: &str) -> Result<IpUpdate, LabError> {
        let verification = self.verify(reference, Some(new_ip))?;
        let device_id = verification.device_id.clone();
        let old_ip = verification.configured_ip.clone();

        if !verification.verified {
            return Ok(IpUpdate {
                success: false,
                updated: false,
                device_id,
                old_ip,
                new_ip: new_ip.to_string(),
                message: "Device identity verification failed. IP not updated.".into(),
                verification,
            });
        }

        if old_ip.as_deref() == Some(new_ip) {
            return Ok(IpUpdate {
                success: true,
                updated: false,
                device_id,
                old_ip,
                new_ip: new_ip.to_string(),
                message: "IP address unchanged".into(),
                verification,
            });
        }

        let previous = self.inventory.update_configured_ip(&device_id, new_ip)?;
        Ok(IpUpdate {
            success: true,
            updated: true,
            message: format!(
                "Device IP updated: {} -> {}",
                previous.as_deref().unwrap_or("<none>"),
                new_ip
            ),
            device_id,
            old_ip: previous,
            new_ip: new_ip.to_string(),
            verification,
        })
    }
}
