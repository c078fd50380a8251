// ── Identity probe – read-only commands that say who a device is ─────────────

use super::types::*;
use lablink_core::FailureKind;
use lablink_ssh::ssh::{
    ChainRequest, CommandOutput, Connector, FallbackChain, SessionTimeouts, SshFailure, SshTarget,
};
use std::sync::Arc;
use std::time::Duration;

/// One way of reading one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeStrategy {
    pub label: &'static str,
    pub command: &'static str,
}

pub const HOSTNAME_STRATEGIES: &[ProbeStrategy] = &[ProbeStrategy {
    label: "hostname",
    command: "hostname",
}];

pub const UNIQUE_ID_STRATEGIES: &[ProbeStrategy] = &[
    ProbeStrategy {
        label: "soc0-serial",
        command: "cat /sys/devices/soc0/serial_number 2>/dev/null",
    },
    ProbeStrategy {
        label: "device-tree-serial",
        command: "cat /proc/device-tree/serial-number 2>/dev/null | tr -d '\\0'",
    },
    ProbeStrategy {
        label: "machine-id",
        command: "cat /etc/machine-id 2>/dev/null",
    },
    ProbeStrategy {
        label: "hostname-fallback",
        command: "hostname",
    },
];

pub const OS_RELEASE_COMMAND: &str = "cat /etc/os-release 2>/dev/null";

const MIN_UNIQUE_ID_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeField {
    Hostname,
    UniqueId,
}

impl ProbeField {
    pub fn plausible(&self, value: &str) -> bool {
        match self {
            ProbeField::Hostname => !value.is_empty(),
            ProbeField::UniqueId => value.chars().count() >= MIN_UNIQUE_ID_LEN,
        }
    }
}

fn clean(stdout: &str) -> String {
    stdout.replace('\0', "").trim().to_string()
}

/// Run `strategies` in order; the first plausible value wins.
///
/// A transport failure is retried up to `retries` times before moving on.  An
/// implausible or empty answer moves on immediately.
pub fn run_strategies<F>(
    strategies: &[ProbeStrategy],
    field: ProbeField,
    retries: u32,
    exec: &mut F,
) -> ProbeOutcome
where
    F: FnMut(&str) -> Result<CommandOutput, SshFailure>,
{
    let mut last_failure: Option<FailureKind> = None;

    for strategy in strategies {
        for attempt in 0..=retries {
            match exec(strategy.command) {
                Ok(output) => {
                    let value = clean(&output.stdout);
                    if output.success() && field.plausible(&value) {
                        log::debug!("{:?} via {}: {}", field, strategy.label, value);
                        return ProbeOutcome::Found(value);
                    }
                    break;
                }
                Err(failure) => {
                    log::debug!(
                        "{} attempt {} failed: {}",
                        strategy.label,
                        attempt + 1,
                        failure
                    );
                    last_failure = Some(failure.kind);
                    if !failure.kind.is_transport() {
                        break;
                    }
                }
            }
        }
    }

    match last_failure {
        Some(kind) => ProbeOutcome::Failed(kind),
        None => ProbeOutcome::Empty,
    }
}

/// Parse `/etc/os-release`; `None` when it holds no recognised key.
pub fn parse_os_release(content: &str) -> Option<FirmwareInfo> {
    let mut info = FirmwareInfo::default();
    let mut seen = false;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'').to_string();
        let slot = match key.trim() {
            "NAME" => &mut info.name,
            "VERSION" => &mut info.version,
            "VERSION_ID" => &mut info.version_id,
            "BUILD_ID" => &mut info.build_id,
            "PRETTY_NAME" => &mut info.pretty_name,
            "FACTORY" => &mut info.factory,
            "LMP_FACTORY" => &mut info.target,
            "MACHINE" => &mut info.machine,
            _ => continue,
        };
        *slot = Some(value);
        seen = true;
    }

    seen.then_some(info)
}

// ── Prober seam ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub ip: String,
    pub port: u16,
    pub username: String,
    /// Known when verifying an inventory device; used for credential lookup.
    pub device_id: Option<String>,
    pub device_class: Option<String>,
}

impl ProbeTarget {
    pub fn address(ip: &str, username: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            username: username.to_string(),
            device_id: None,
            device_class: None,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait IdentityProber: Send + Sync {
    fn probe(&self, target: &ProbeTarget) -> ProbeReport;
}

/// Probe over a short-lived direct SSH session.
pub struct SshIdentityProbe {
    connector: Arc<dyn Connector>,
    chain: Arc<FallbackChain>,
    connect_timeout: Duration,
    command_timeout: Duration,
    retries: u32,
}

impl SshIdentityProbe {
    pub fn new(
        connector: Arc<dyn Connector>,
        chain: Arc<FallbackChain>,
        connect_timeout: Duration,
        command_timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            connector,
            chain,
            connect_timeout,
            command_timeout,
            retries,
        }
    }
}

impl IdentityProber for SshIdentityProbe {
    fn probe(&self, target: &ProbeTarget) -> ProbeReport {
        let ssh_target = SshTarget::new(target.ip.clone(), target.port);
        let request = ChainRequest {
            device_id: target.device_id.as_deref(),
            target: &ssh_target,
            username: &target.username,
            device_class: target.device_class.as_deref(),
        };

        let established = match self.chain.connect(
            self.connector.as_ref(),
            &request,
            SessionTimeouts::new(self.connect_timeout),
        ) {
            Ok(established) => established,
            Err(failed) => {
                log::info!("Probe of {} failed: {}", ssh_target.addr(), failed.failure);
                return ProbeReport::unreachable(
                    &target.ip,
                    &failed.username,
                    CachedError {
                        kind: failed.failure.kind,
                        message: failed.failure.message,
                    },
                );
            }
        };

        let session = Arc::clone(&established.session);
        let timeout = self.command_timeout;
        let mut exec = |command: &str| session.exec(command, timeout);

        let hostname = run_strategies(
            HOSTNAME_STRATEGIES,
            ProbeField::Hostname,
            self.retries,
            &mut exec,
        );
        let unique_id = run_strategies(
            UNIQUE_ID_STRATEGIES,
            ProbeField::UniqueId,
            self.retries,
            &mut exec,
        );
        let firmware = match exec(OS_RELEASE_COMMAND) {
            Ok(output) if output.success() => parse_os_release(&output.stdout),
            Ok(_) => None,
            Err(e) => {
                log::debug!("os-release unavailable on {}: {}", target.ip, e);
                None
            }
        };
        established.session.close();

        ProbeReport {
            ip: target.ip.clone(),
            hostname,
            unique_id,
            firmware,
            username: established.username,
            auth: Some(established.auth),
            error: None,
        }
    }
}
