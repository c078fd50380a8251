//! Device inventory.
//!
//! The inventory is external configuration: this crate reads it and only ever
//! rewrites one `ip` field of one device (after a verified DHCP change).
//! Unknown keys in the file survive that rewrite.

use crate::error::LabError;
use crate::persist::write_json_atomic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_SSH_PORT: u16 = 22;

// ── On-disk shape ────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    devices: BTreeMap<String, DeviceEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceEntry {
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    soc_id: Option<String>,
    #[serde(default)]
    friendly_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    ssh_user: Option<String>,
    #[serde(default)]
    ssh_port: Option<u16>,
    #[serde(default)]
    ports: Option<PortsEntry>,
    #[serde(default)]
    device_class: Option<String>,
    #[serde(default)]
    device_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PortsEntry {
    #[serde(default)]
    ssh: Option<u16>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl DeviceEntry {
    fn into_record(self, device_id: &str) -> DeviceRecord {
        let port = self
            .ssh_port
            .or_else(|| self.ports.as_ref().and_then(|p| p.ssh))
            .unwrap_or(DEFAULT_SSH_PORT);
        DeviceRecord {
            device_id: device_id.to_string(),
            friendly_name: non_empty(self.friendly_name)
                .or_else(|| non_empty(self.name))
                .unwrap_or_else(|| device_id.to_string()),
            configured_ip: non_empty(self.ip),
            expected_hostname: non_empty(self.hostname).unwrap_or_else(|| device_id.to_string()),
            expected_unique_id: non_empty(self.unique_id).or_else(|| non_empty(self.soc_id)),
            ssh_user: non_empty(self.ssh_user).unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
            ssh_port: port,
            device_class: non_empty(self.device_class).or_else(|| non_empty(self.device_type)),
        }
    }
}

// ── Public types ─────────────────────────────────────────────────────────────

/// One configured lab device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub device_id: String,
    pub friendly_name: String,
    pub configured_ip: Option<String>,
    /// Configured hostname, or the device id when none is configured.
    pub expected_hostname: String,
    pub expected_unique_id: Option<String>,
    pub ssh_user: String,
    pub ssh_port: u16,
    pub device_class: Option<String>,
}

impl DeviceRecord {
    pub fn new(device_id: &str) -> Self {
        DeviceEntry::default().into_record(device_id)
    }
}

/// Immutable view of all configured devices, ordered by device id.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    devices: BTreeMap<String, DeviceRecord>,
}

impl Inventory {
    pub fn from_records<I: IntoIterator<Item = DeviceRecord>>(records: I) -> Self {
        Self {
            devices: records
                .into_iter()
                .map(|r| (r.device_id.clone(), r))
                .collect(),
        }
    }

    pub fn parse(json: &str) -> Result<Self, LabError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        let file: InventoryFile = serde_json::from_str(json)?;
        Ok(Self {
            devices: file
                .devices
                .into_iter()
                .map(|(id, entry)| {
                    let record = entry.into_record(&id);
                    (id, record)
                })
                .collect(),
        })
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceRecord> {
        self.devices.get(device_id)
    }

    /// Match a device reference: exact id, then id or friendly name ignoring case.
    pub fn resolve(&self, reference: &str) -> Option<&DeviceRecord> {
        let reference = reference.trim();
        if let Some(record) = self.devices.get(reference) {
            return Some(record);
        }
        let lower = reference.to_lowercase();
        self.devices
            .values()
            .find(|r| r.device_id.to_lowercase() == lower)
            .or_else(|| {
                self.devices
                    .values()
                    .find(|r| r.friendly_name.to_lowercase() == lower)
            })
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// File-backed inventory shared by every consumer in the process.
pub struct InventoryStore {
    path: PathBuf,
    inventory: RwLock<Inventory>,
    write_lock: Mutex<()>,
}

impl InventoryStore {
    /// Open the inventory file; a missing file is an empty inventory.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LabError> {
        let path = path.into();
        let inventory = Self::read(&path)?;
        log::info!(
            "Loaded {} device(s) from {}",
            inventory.len(),
            path.display()
        );
        Ok(Self {
            path,
            inventory: RwLock::new(inventory),
            write_lock: Mutex::new(()),
        })
    }

    fn read(path: &Path) -> Result<Inventory, LabError> {
        if !path.exists() {
            log::warn!("Inventory {} does not exist", path.display());
            return Ok(Inventory::default());
        }
        let content = std::fs::read_to_string(path)?;
        Inventory::parse(&content)
            .map_err(|e| LabError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Inventory {
        self.inventory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn resolve(&self, reference: &str) -> Result<DeviceRecord, LabError> {
        self.inventory
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .resolve(reference)
            .cloned()
            .ok_or_else(|| LabError::DeviceNotFound(reference.to_string()))
    }

    pub fn reload(&self) -> Result<(), LabError> {
        let fresh = Self::read(&self.path)?;
        *self.inventory.write().unwrap_or_else(|e| e.into_inner()) = fresh;
        Ok(())
    }

    /// Rewrite the `ip` of one device, returning the previous value.
    pub fn update_configured_ip(
        &self,
        device_id: &str,
        new_ip: &str,
    ) -> Result<Option<String>, LabError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let content = if self.path.exists() {
            std::fs::read_to_string(&self.path)?
        } else {
            String::new()
        };
        let mut raw: serde_json::Value = if content.trim().is_empty() {
            serde_json::json!({ "devices": {} })
        } else {
            serde_json::from_str(&content)?
        };

        let entry = raw
            .get_mut("devices")
            .and_then(|d| d.get_mut(device_id))
            .and_then(|e| e.as_object_mut())
            .ok_or_else(|| LabError::DeviceNotFound(device_id.to_string()))?;

        let old_ip = entry
            .get("ip")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        entry.insert("ip".into(), serde_json::Value::String(new_ip.to_string()));

        write_json_atomic(&self.path, &raw)?;

        let mut inventory = self.inventory.write().unwrap_or_else(|e| e.into_inner());
        if let Some(record) = inventory.devices.get_mut(device_id) {
            record.configured_ip = Some(new_ip.to_string());
        }

        log::info!(
            "Inventory: {} ip {} -> {}",
            device_id,
            old_ip.as_deref().unwrap_or("<none>"),
            new_ip
        );
        Ok(old_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "devices": {
            "sentai-01": {
                "ip": "10.0.0.5",
                "hostname": "sentai-01",
                "unique_id": "ABC123",
                "friendly_name": "Sentai Bench 1",
                "ports": {"ssh": 2222, "http": 80}
            },
            "imx93-board": {
                "ip": "10.0.0.7",
                "soc_id": "0x5fa1",
                "name": "Carrier Board",
                "ssh_user": "fio",
                "device_type": "foundries",
                "notes": "kept on rewrite"
            }
        }
    }"#;

    #[test]
    fn test_parse_and_defaults() {
        let inventory = Inventory::parse(SAMPLE).unwrap();
        assert_eq!(inventory.len(), 2);

        let sentai = inventory.get("sentai-01").unwrap();
        assert_eq!(sentai.ssh_port, 2222);
        assert_eq!(sentai.ssh_user, "root");
        assert_eq!(sentai.expected_unique_id.as_deref(), Some("ABC123"));

        let board = inventory.get("imx93-board").unwrap();
        assert_eq!(board.expected_hostname, "imx93-board");
        assert_eq!(board.expected_unique_id.as_deref(), Some("0x5fa1"));
        assert_eq!(board.friendly_name, "Carrier Board");
        assert_eq!(board.device_class.as_deref(), Some("foundries"));
        assert_eq!(board.ssh_port, 22);
    }

    #[test]
    fn test_resolve_by_id_or_friendly_name() {
        let inventory = Inventory::parse(SAMPLE).unwrap();
        assert_eq!(inventory.resolve("SENTAI-01").unwrap().device_id, "sentai-01");
        assert_eq!(
            inventory.resolve("carrier board").unwrap().device_id,
            "imx93-board"
        );
        assert!(inventory.resolve("nope").is_none());
    }

    #[test]
    fn test_store_resolve_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::open(dir.path().join("missing.json")).unwrap();
        assert!(matches!(
            store.resolve("sentai-01"),
            Err(LabError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_update_configured_ip_rewrites_one_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab_devices.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let store = InventoryStore::open(&path).unwrap();
        let old = store.update_configured_ip("imx93-board", "10.0.0.42").unwrap();
        assert_eq!(old.as_deref(), Some("10.0.0.7"));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["devices"]["imx93-board"]["ip"], "10.0.0.42");
        assert_eq!(raw["devices"]["imx93-board"]["notes"], "kept on rewrite");
        assert_eq!(raw["devices"]["sentai-01"]["ip"], "10.0.0.5");

        assert_eq!(
            store.resolve("imx93-board").unwrap().configured_ip.as_deref(),
            Some("10.0.0.42")
        );
    }

    #[test]
    fn test_update_unknown_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab_devices.json");
        std::fs::write(&path, SAMPLE).unwrap();
        let store = InventoryStore::open(&path).unwrap();

        let err = store.update_configured_ip("ghost", "10.0.0.1").unwrap_err();
        assert!(matches!(err, LabError::DeviceNotFound(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), SAMPLE);
    }
}
