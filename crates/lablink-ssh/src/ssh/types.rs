use lablink_core::{classify_failure, FailureKind, LabError};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ===============================
// Targets & timeouts
// ===============================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// TCP connect, handshake and authentication.
    pub connect: Duration,
}

impl SessionTimeouts {
    pub fn new(connect: Duration) -> Self {
        Self { connect }
    }
}

// ===============================
// Authentication
// ===============================

/// Which link of the fallback chain produced a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Key,
    CachedPassword,
    DefaultPassword,
}

#[derive(Clone)]
pub enum AuthMethod {
    /// Agent identities, then key files.
    Key,
    Password(SecretString),
}

#[derive(Clone)]
pub struct AuthAttempt {
    pub username: String,
    pub kind: AuthKind,
    pub method: AuthMethod,
}

impl AuthAttempt {
    pub fn key(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            kind: AuthKind::Key,
            method: AuthMethod::Key,
        }
    }

    pub fn password(username: impl Into<String>, kind: AuthKind, secret: SecretString) -> Self {
        Self {
            username: username.into(),
            kind,
            method: AuthMethod::Password(secret),
        }
    }
}

impl fmt::Debug for AuthAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthAttempt")
            .field("username", &self.username)
            .field("kind", &self.kind)
            .finish()
    }
}

// ===============================
// Results
// ===============================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// How an operation reached the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Multiplexed,
    Direct,
}

/// A classified transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SshFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl SshFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Derive the kind from the message text.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_failure(&message),
            message,
        }
    }

    /// The remote side refused or failed the request on a working session.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(FailureKind::RemoteError, message)
    }

    /// A local file problem met while moving data.
    pub fn local(context: &str, err: &std::io::Error) -> Self {
        Self::new(FailureKind::LocalError, format!("{}: {}", context, err))
    }

    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let message = format!("{}: {}", context, err);
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Self::new(FailureKind::Timeout, message)
            }
            ErrorKind::ConnectionRefused => Self::new(FailureKind::ConnectionRefused, message),
            _ => Self::classify(message),
        }
    }
}

impl From<SshFailure> for LabError {
    fn from(f: SshFailure) -> Self {
        LabError::transport(f.kind, f.message)
    }
}
