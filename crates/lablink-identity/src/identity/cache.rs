// ── Identity cache – IP → last known identity, persisted as one JSON object ──
//
// Every operation reads the file afresh so that several processes sharing a
// cache directory see each other's writes.  Mutations are serialised by the
// internal lock and land through an atomic rename.

use super::types::*;
use chrono::{DateTime, Utc};
use lablink_core::persist::write_json_atomic;
use lablink_core::LabError;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

type Entries = BTreeMap<String, CacheEntry>;

pub struct IdentityCache {
    path: PathBuf,
    ttl: chrono::Duration,
    lock: Mutex<()>,
}

impl IdentityCache {
    pub fn new(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36500)),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".bak");
        PathBuf::from(name)
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(entry.cached_at) < self.ttl
    }

    /// Everything on disk, stale entries included.  Unreadable content is
    /// moved aside to the `.bak` file and treated as an empty cache.
    fn load(&self) -> Entries {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Entries::new(),
            Err(e) => {
                log::warn!("Cannot read identity cache {}: {}", self.path.display(), e);
                return Entries::new();
            }
        };
        if content.trim().is_empty() {
            return Entries::new();
        }

        match serde_json::from_str::<Entries>(&content) {
            Ok(entries) => entries,
            Err(e) => {
                let corrupt = LabError::CacheCorrupt {
                    path: self.path.display().to_string(),
                    reason: e.to_string(),
                };
                let backup = self.backup_path();
                match fs::copy(&self.path, &backup) {
                    Ok(_) => log::warn!("{}; saved to {}", corrupt, backup.display()),
                    Err(copy_err) => log::warn!("{}; backup failed: {}", corrupt, copy_err),
                }
                Entries::new()
            }
        }
    }

    fn save(&self, entries: &Entries) -> Result<(), LabError> {
        write_json_atomic(&self.path, entries)
    }

    // ── reads ───────────────────────────────────────────────────────────

    pub fn get(&self, ip: &str) -> Option<CacheEntry> {
        self.get_at(ip, Utc::now())
    }

    /// The entry for `ip` unless it is absent or older than the TTL.
    pub fn get_at(&self, ip: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        self.load()
            .remove(ip)
            .filter(|entry| self.is_fresh(entry, now))
    }

    pub fn friendly_name(&self, ip: &str) -> Option<String> {
        self.get(ip).and_then(|e| e.friendly_name)
    }

    /// Fresh entries, ordered by IP.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let now = Utc::now();
        self.load()
            .into_values()
            .filter(|e| self.is_fresh(e, now))
            .collect()
    }

    /// The most recently written fresh entry resolved to `device_id`.
    pub fn find_by_device(&self, device_id: &str) -> Option<CacheEntry> {
        self.find_by_device_at(device_id, Utc::now())
    }

    pub fn find_by_device_at(&self, device_id: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        self.load()
            .into_values()
            .filter(|e| self.is_fresh(e, now))
            .filter(|e| e.resolved_device_id.as_deref() == Some(device_id))
            .max_by_key(|e| e.cached_at)
    }

    // ── writes ──────────────────────────────────────────────────────────

    pub fn merge(&self, ip: &str, update: CacheUpdate) -> Result<CacheEntry, LabError> {
        self.merge_at(ip, update, Utc::now())
    }

    /// Fold `update` into the entry for `ip` and persist before returning.
    ///
    /// Once an entry knows who the device is, a write that does not itself
    /// establish identity only records its error.  A write that establishes
    /// identity clears any stored error.  An expired entry is replaced
    /// wholesale.
    pub fn merge_at(
        &self,
        ip: &str,
        update: CacheUpdate,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, LabError> {
        let _guard = self.guard();
        let mut entries = self.load();

        let mut entry = match entries.remove(ip) {
            Some(existing) if self.is_fresh(&existing, now) => existing,
            _ => CacheEntry::new(ip, now),
        };

        if entry.identity_established() && !update.establishes_identity() {
            if let Some(error) = update.error {
                log::debug!("Cache {}: keeping identity, recording {}", ip, error.kind);
                entry.last_error = Some(error);
            }
        } else {
            apply(&mut entry, update);
            entry.cached_at = now;
        }

        entries.insert(ip.to_string(), entry.clone());
        self.save(&entries)?;
        Ok(entry)
    }

    /// Manually rename the unit at `ip`. `false` when nothing fresh is stored
    /// for it.
    pub fn update_friendly_name(&self, ip: &str, name: &str) -> Result<bool, LabError> {
        let _guard = self.guard();
        let now = Utc::now();
        let mut entries = self.load();
        let Some(entry) = entries
            .get_mut(ip)
            .filter(|entry| self.is_fresh(entry, now))
        else {
            return Ok(false);
        };
        entry.friendly_name = Some(name.to_string());
        entry.friendly_name_updated = Some(Utc::now());
        self.save(&entries)?;
        log::info!("Cache {}: friendly name set to '{}'", ip, name);
        Ok(true)
    }

    /// Drop every entry, returning how many were stored.
    pub fn clear(&self) -> Result<usize, LabError> {
        let _guard = self.guard();
        let count = self.load().len();
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        log::info!("Identity cache cleared ({} entries)", count);
        Ok(count)
    }
}

fn apply(entry: &mut CacheEntry, update: CacheUpdate) {
    let establishes = update.establishes_identity();

    if update.hostname.is_some() {
        entry.hostname = update.hostname;
    }
    if update.unique_id.is_some() {
        entry.unique_id = update.unique_id;
    }
    if update.firmware_info.is_some() {
        entry.firmware_info = update.firmware_info;
    }
    match update.match_candidates {
        Some(candidates) => {
            entry.match_candidates = candidates;
            entry.resolved_device_id = update.resolved_device_id;
        }
        None => {
            if update.resolved_device_id.is_some() {
                entry.resolved_device_id = update.resolved_device_id;
            }
        }
    }
    if update.friendly_name.is_some() && entry.friendly_name_updated.is_none() {
        entry.friendly_name = update.friendly_name;
    }

    if establishes {
        entry.last_error = None;
    } else if update.error.is_some() {
        entry.last_error = update.error;
    }
}
