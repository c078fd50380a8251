//! In-memory lab: a connector whose "devices" answer the identity probe,
//! run a few shell commands and keep uploaded files in memory.

#![allow(dead_code)]

use lablink::core::{FailureKind, LabConfig};
use lablink::ssh::{
    AuthAttempt, AuthMethod, CommandOutput, Connector, RemoteSession, SessionTimeouts, SshFailure,
    SshTarget,
};
use lablink::LabService;
use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const INVENTORY: &str = r#"{
    "devices": {
        "sentai-01": {
            "ip": "10.0.0.5",
            "hostname": "sentai",
            "unique_id": "ABC123",
            "friendly_name": "Sentai Bench 1"
        },
        "imx93-board": {
            "ip": "10.0.0.7",
            "soc_id": "0x5fa1c0de",
            "ssh_user": "fio",
            "device_type": "foundries",
            "notes": "carrier rev B"
        }
    }
}"#;

#[derive(Default)]
pub struct FakeDevice {
    pub hostname: String,
    pub unique_id: Option<String>,
    pub accepts_key: bool,
    /// (username, password) accepted for password logins.
    pub login: Option<(String, String)>,
    pub refuses: bool,
    pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    pub commands: Mutex<Vec<String>>,
}

impl FakeDevice {
    pub fn keyed(hostname: &str, unique_id: Option<&str>) -> Self {
        Self {
            hostname: hostname.into(),
            unique_id: unique_id.map(str::to_string),
            accepts_key: true,
            ..Self::default()
        }
    }

    pub fn password_only(hostname: &str, user: &str, password: &str) -> Self {
        Self {
            hostname: hostname.into(),
            login: Some((user.into(), password.into())),
            ..Self::default()
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuses: true,
            ..Self::default()
        }
    }

    pub fn file_names(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeLab {
    devices: Mutex<BTreeMap<String, Arc<FakeDevice>>>,
    pub connects: AtomicUsize,
}

impl FakeLab {
    pub fn with(self, ip: &str, device: FakeDevice) -> Self {
        self.devices
            .lock()
            .unwrap()
            .insert(ip.to_string(), Arc::new(device));
        self
    }

    pub fn device(&self, ip: &str) -> Arc<FakeDevice> {
        Arc::clone(&self.devices.lock().unwrap()[ip])
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for FakeLab {
    fn connect(
        &self,
        target: &SshTarget,
        attempt: &AuthAttempt,
        _timeouts: SessionTimeouts,
    ) -> Result<Arc<dyn RemoteSession>, SshFailure> {
        let device = self
            .devices
            .lock()
            .unwrap()
            .get(&target.host)
            .cloned()
            .ok_or_else(|| {
                SshFailure::classify(format!("connect to host {}: Connection timed out", target.host))
            })?;
        if device.refuses {
            return Err(SshFailure::classify(format!(
                "connect to host {} port {}: Connection refused",
                target.host, target.port
            )));
        }

        let accepted = match &attempt.method {
            AuthMethod::Key => device.accepts_key,
            AuthMethod::Password(secret) => device.login.as_ref().map_or(false, |(user, pass)| {
                user == &attempt.username && pass == secret.expose_secret()
            }),
        };
        if !accepted {
            return Err(SshFailure::new(
                FailureKind::AuthFailed,
                format!("{}@{}: Permission denied", attempt.username, target.host),
            ));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            device,
            open: AtomicBool::new(true),
        }))
    }
}

struct FakeSession {
    device: Arc<FakeDevice>,
    open: AtomicBool,
}

fn output(exit_status: i32, stdout: impl Into<String>) -> Result<CommandOutput, SshFailure> {
    Ok(CommandOutput {
        exit_status,
        stdout: stdout.into(),
        stderr: String::new(),
    })
}

fn unquote(arg: &str) -> String {
    arg.trim_matches('\'').to_string()
}

impl RemoteSession for FakeSession {
    fn exec(&self, command: &str, _timeout: Duration) -> Result<CommandOutput, SshFailure> {
        self.device.commands.lock().unwrap().push(command.to_string());
        let device = &self.device;

        if command == "hostname" {
            return output(0, format!("{}\n", device.hostname));
        }
        if command.contains("soc0/serial_number") {
            return output(0, device.unique_id.clone().unwrap_or_default());
        }
        if command.contains("device-tree") || command.contains("machine-id") {
            return output(0, "");
        }
        if command.contains("os-release") {
            return output(0, "NAME=\"Linux-microPlatform\"\nVERSION_ID=4.0.11\n");
        }
        if command.starts_with("mkdir -p") {
            if command.contains("/readonly") {
                return Ok(CommandOutput {
                    exit_status: 1,
                    stdout: String::new(),
                    stderr: "mkdir: cannot create directory '/readonly': Permission denied".into(),
                });
            }
            return output(0, "");
        }
        if let Some(root) = command.strip_prefix("find ") {
            let root = unquote(root.trim_end_matches(" -type f"));
            let listing: Vec<String> = device
                .file_names()
                .into_iter()
                .filter(|p| p.starts_with(&format!("{}/", root)))
                .collect();
            return output(0, listing.join("\n"));
        }
        if let Some(args) = command.strip_prefix("rm -f ") {
            let mut files = device.files.lock().unwrap();
            for arg in args.split_whitespace() {
                files.remove(&unquote(arg));
            }
            return output(0, "");
        }
        if let Some(text) = command.strip_prefix("echo ") {
            return output(0, format!("{}\n", text));
        }
        if command == "false" {
            return output(1, "");
        }
        Ok(CommandOutput {
            exit_status: 127,
            stdout: String::new(),
            stderr: format!("sh: {}: not found", command),
        })
    }

    fn upload(&self, local: &Path, remote: &str, _mode: i32, _timeout: Duration) -> Result<u64, SshFailure> {
        let data = std::fs::read(local).map_err(|e| SshFailure::local("read local", &e))?;
        let len = data.len() as u64;
        self.device
            .files
            .lock()
            .unwrap()
            .insert(remote.to_string(), data);
        Ok(len)
    }

    fn download(&self, remote: &str, local: &Path, _timeout: Duration) -> Result<u64, SshFailure> {
        let data = self
            .device
            .files
            .lock()
            .unwrap()
            .get(remote)
            .cloned()
            .ok_or_else(|| SshFailure::remote(format!("scp: {}: No such file or directory", remote)))?;
        std::fs::write(local, &data).map_err(|e| SshFailure::local("write local", &e))?;
        Ok(data.len() as u64)
    }

    fn is_alive(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

pub struct TestLab {
    pub dir: tempfile::TempDir,
    pub lab: Arc<FakeLab>,
    pub service: LabService,
}

impl TestLab {
    pub fn inventory_path(&self) -> std::path::PathBuf {
        self.dir.path().join("lab_devices.json")
    }
}

pub fn config_in(dir: &Path) -> LabConfig {
    let mut config = LabConfig::default();
    config.inventory_path = dir.join("lab_devices.json");
    config.cache_dir = dir.join("cache");
    config.credentials_path = dir.join("credentials.json");
    config.probe_retries = 0;
    config
}

pub fn test_lab(lab: FakeLab) -> TestLab {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lab_devices.json"), INVENTORY).unwrap();
    let lab = Arc::new(lab);
    let service = LabService::with_connector(config_in(dir.path()), lab.clone()).unwrap();
    TestLab { dir, lab, service }
}
