//! Runtime configuration.
//!
//! Loaded from `$LABLINK_CONFIG` or `<config_dir>/lablink/config.json`.  A
//! missing file yields the defaults; every field has a serde default so a
//! partial file is valid.  Path fields can be overridden from the environment.

use crate::error::LabError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_CONFIG: &str = "LABLINK_CONFIG";
pub const ENV_DEVICES_CONFIG: &str = "LABLINK_DEVICES_CONFIG";
pub const ENV_CACHE_DIR: &str = "LABLINK_CACHE_DIR";
pub const ENV_CREDENTIALS: &str = "LABLINK_CREDENTIALS";

pub const CACHE_FILE_NAME: &str = "device_cache.json";
pub const MAX_BATCH_CONCURRENCY: usize = 50;

// ── Serde default helpers ────────────────────────────────────────────────────

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join("lablink")
}
fn default_config_path() -> PathBuf {
    app_dir(dirs::config_dir()).join("config.json")
}
fn default_inventory_path() -> PathBuf {
    app_dir(dirs::config_dir()).join("lab_devices.json")
}
fn default_cache_dir() -> PathBuf {
    app_dir(dirs::cache_dir())
}
fn default_credentials_path() -> PathBuf {
    app_dir(dirs::config_dir()).join("credentials.json")
}
fn default_probe_connect_secs() -> u64 {
    3
}
fn default_probe_command_secs() -> u64 {
    5
}
fn default_connect_secs() -> u64 {
    10
}
fn default_exec_secs() -> u64 {
    60
}
fn default_transfer_secs() -> u64 {
    60
}
fn default_sync_secs() -> u64 {
    300
}
fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_concurrency() -> usize {
    5
}
fn default_probe_retries() -> u32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_logins() -> BTreeMap<String, DefaultLogin> {
    // Linux microPlatform images ship with fio/fio until provisioned.
    let mut map = BTreeMap::new();
    map.insert(
        "foundries".to_string(),
        DefaultLogin {
            username: "fio".into(),
            password: "fio".into(),
        },
    );
    map
}

// ── Types ────────────────────────────────────────────────────────────────────

/// Timeouts in seconds for each class of remote call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    #[serde(default = "default_probe_connect_secs")]
    pub probe_connect_secs: u64,
    #[serde(default = "default_probe_command_secs")]
    pub probe_command_secs: u64,
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_exec_secs")]
    pub exec_secs: u64,
    #[serde(default = "default_transfer_secs")]
    pub transfer_secs: u64,
    #[serde(default = "default_sync_secs")]
    pub sync_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_connect_secs: default_probe_connect_secs(),
            probe_command_secs: default_probe_command_secs(),
            connect_secs: default_connect_secs(),
            exec_secs: default_exec_secs(),
            transfer_secs: default_transfer_secs(),
            sync_secs: default_sync_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn probe_connect(&self) -> Duration {
        Duration::from_secs(self.probe_connect_secs)
    }
    pub fn probe_command(&self) -> Duration {
        Duration::from_secs(self.probe_command_secs)
    }
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }
    pub fn exec(&self) -> Duration {
        Duration::from_secs(self.exec_secs)
    }
    pub fn transfer(&self) -> Duration {
        Duration::from_secs(self.transfer_secs)
    }
    pub fn sync(&self) -> Duration {
        Duration::from_secs(self.sync_secs)
    }
}

/// A device-class default login, tried last in the credential chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultLogin {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabConfig {
    #[serde(default = "default_inventory_path")]
    pub inventory_path: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_concurrency")]
    pub batch_concurrency: usize,
    #[serde(default = "default_probe_retries")]
    pub probe_retries: u32,
    /// Try the running ssh-agent before key files.
    #[serde(default = "default_true")]
    pub use_agent: bool,
    /// Private keys tried in order; empty means the usual `~/.ssh/id_*` files.
    #[serde(default)]
    pub identity_files: Vec<PathBuf>,
    /// Device class → default login. The `"default"` key applies to devices
    /// without a class of their own.
    #[serde(default = "default_logins")]
    pub default_credentials: BTreeMap<String, DefaultLogin>,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            inventory_path: default_inventory_path(),
            cache_dir: default_cache_dir(),
            credentials_path: default_credentials_path(),
            timeouts: TimeoutConfig::default(),
            cache_ttl_secs: default_cache_ttl_secs(),
            batch_concurrency: default_concurrency(),
            probe_retries: default_probe_retries(),
            use_agent: true,
            identity_files: Vec::new(),
            default_credentials: default_logins(),
        }
    }
}

impl LabConfig {
    /// Load from `$LABLINK_CONFIG` (or the default path) and apply env overrides.
    pub fn load() -> Result<Self, LabError> {
        let path = std::env::var_os(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(default_config_path);
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var_os(key));
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, LabError> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&content)
            .map_err(|e| LabError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<OsString>,
    {
        if let Some(v) = lookup(ENV_DEVICES_CONFIG) {
            self.inventory_path = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_CACHE_DIR) {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_CREDENTIALS) {
            self.credentials_path = PathBuf::from(v);
        }
    }

    pub fn cache_file(&self) -> PathBuf {
        self.cache_dir.join(CACHE_FILE_NAME)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Batch width clamped to `1..=50`.
    pub fn concurrency(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.batch_concurrency)
            .clamp(1, MAX_BATCH_CONCURRENCY)
    }

    /// Key files to offer, defaulting to the common `~/.ssh` names.
    pub fn key_files(&self) -> Vec<PathBuf> {
        if !self.identity_files.is_empty() {
            return self.identity_files.clone();
        }
        match dirs::home_dir() {
            Some(home) => ["id_ed25519", "id_rsa", "id_ecdsa"]
                .iter()
                .map(|name| home.join(".ssh").join(name))
                .collect(),
            None => Vec::new(),
        }
    }
}
