//! JSON-backed credential store.
//!
//! Entries are keyed `"<reference>:<kind>"` where the reference is a device id
//! or an IP address (devices found during discovery have no id yet).  The file
//! is rewritten atomically; the temp file it is staged in is created `0600`.

use crate::types::*;
use chrono::Utc;
use lablink_core::persist::write_json_atomic;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Read side used by the connection layer.
pub trait CredentialLookup: Send + Sync {
    fn get_credential(&self, reference: &str, kind: CredentialKind) -> Option<Credential>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    credentials: BTreeMap<String, StoredCredential>,
}

fn entry_key(reference: &str, kind: CredentialKind) -> String {
    format!("{}:{}", reference.trim(), kind.as_str())
}

fn split_key(key: &str) -> Option<(&str, CredentialKind)> {
    let (reference, kind) = key.rsplit_once(':')?;
    Some((reference, CredentialKind::parse(kind)?))
}

pub struct CredentialStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, StoredCredential>>,
}

impl CredentialStore {
    /// Open the store; a missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = Self::load(&path);
        log::debug!(
            "Credential store {} holds {} entr(y/ies)",
            path.display(),
            entries.len()
        );
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn load(path: &Path) -> BTreeMap<String, StoredCredential> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                log::warn!("Cannot read credential store {}: {}", path.display(), e);
                return BTreeMap::new();
            }
        };
        if content.trim().is_empty() {
            return BTreeMap::new();
        }
        match serde_json::from_str::<CredentialFile>(&content) {
            Ok(file) => file.credentials,
            Err(e) => {
                log::warn!(
                    "Credential store {} is not valid JSON, ignoring it: {}",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, StoredCredential>) -> Result<(), CredentialError> {
        let file = CredentialFile {
            credentials: entries.clone(),
        };
        write_json_atomic(&self.path, &file)?;
        Ok(())
    }

    pub fn get(&self, reference: &str, kind: CredentialKind) -> Option<Credential> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(&entry_key(reference, kind)).map(|stored| Credential {
            username: stored.username.clone(),
            password: stored
                .password
                .as_ref()
                .map(|p| SecretString::new(p.clone())),
        })
    }

    pub fn cache_credential(
        &self,
        reference: &str,
        username: &str,
        password: Option<&SecretString>,
        kind: CredentialKind,
    ) -> Result<(), CredentialError> {
        if reference.trim().is_empty() {
            return Err(CredentialError::EmptyReference);
        }
        if username.trim().is_empty() {
            return Err(CredentialError::EmptyUsername);
        }

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = entries.clone();
        next.insert(
            entry_key(reference, kind),
            StoredCredential {
                username: username.trim().to_string(),
                password: password.map(|p| p.expose_secret().clone()),
                updated_at: Utc::now(),
            },
        );
        self.persist(&next)?;
        *entries = next;

        log::info!("Cached {} credential for {} ({})", kind, reference, username);
        Ok(())
    }

    /// Returns whether an entry was removed.
    pub fn remove_credential(
        &self,
        reference: &str,
        kind: CredentialKind,
    ) -> Result<bool, CredentialError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let key = entry_key(reference, kind);
        if !entries.contains_key(&key) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(&key);
        self.persist(&next)?;
        *entries = next;

        log::info!("Removed {} credential for {}", kind, reference);
        Ok(true)
    }

    pub fn list(&self) -> Vec<CredentialSummary> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter_map(|(key, stored)| {
                let (reference, kind) = split_key(key)?;
                Some(CredentialSummary {
                    reference: reference.to_string(),
                    kind,
                    username: stored.username.clone(),
                    has_password: stored.password.as_deref().map_or(false, |p| !p.is_empty()),
                    updated_at: stored.updated_at,
                })
            })
            .collect()
    }
}

impl CredentialLookup for CredentialStore {
    fn get_credential(&self, reference: &str, kind: CredentialKind) -> Option<Credential> {
        self.get(reference, kind)
    }
}
