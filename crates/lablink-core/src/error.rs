//! Failure taxonomy shared by every crate in the workspace.
//!
//! Transport failures are reduced to exactly one [`FailureKind`] by matching
//! known substrings of the combined error text.  The checks run in a fixed
//! priority order: timeout, connection refused, authentication, and finally
//! the catch-all connection error.
//!
//! `RemoteError` and `LocalError` are never produced by classification.  The
//! operation layer assigns them when the session is fine but the remote side
//! rejected the request, or when a local file could not be used.

use serde::{Deserialize, Serialize};
use std::fmt;

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out"];
const REFUSED_MARKERS: &[&str] = &["connection refused"];
const AUTH_MARKERS: &[&str] = &["permission denied", "authentication failed"];

/// Classification of a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    AuthFailed,
    ConnectionError,
    /// The session works; the remote command or transfer failed.
    RemoteError,
    /// A local file could not be read or written.
    LocalError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::AuthFailed => "auth_failed",
            FailureKind::ConnectionError => "connection_error",
            FailureKind::RemoteError => "remote_error",
            FailureKind::LocalError => "local_error",
        }
    }

    /// Whether the failure says something about the link itself.
    pub fn is_transport(&self) -> bool {
        !matches!(self, FailureKind::RemoteError | FailureKind::LocalError)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify combined stderr/stdout (or library error) text.
pub fn classify_failure(text: &str) -> FailureKind {
    let lower = text.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if has(TIMEOUT_MARKERS) {
        FailureKind::Timeout
    } else if has(REFUSED_MARKERS) {
        FailureKind::ConnectionRefused
    } else if has(AUTH_MARKERS) {
        FailureKind::AuthFailed
    } else {
        FailureKind::ConnectionError
    }
}

/// Serialisable error tag carried in operation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    ConnectionRefused,
    AuthFailed,
    ConnectionError,
    RemoteError,
    DeviceNotFound,
    CacheCorrupt,
    InvalidRequest,
    /// The device answered but is not the expected unit.
    VerificationFailed,
    Internal,
}

impl From<FailureKind> for ErrorKind {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Timeout => ErrorKind::Timeout,
            FailureKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            FailureKind::AuthFailed => ErrorKind::AuthFailed,
            FailureKind::ConnectionError => ErrorKind::ConnectionError,
            FailureKind::RemoteError => ErrorKind::RemoteError,
            FailureKind::LocalError => ErrorKind::InvalidRequest,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabError {
    #[error("operation timed out: {0}")]
    Timeout(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("remote operation failed: {0}")]
    Remote(String),
    #[error("device '{0}' not found in inventory")]
    DeviceNotFound(String),
    #[error("cache file {path} is corrupt: {reason}")]
    CacheCorrupt { path: String, reason: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LabError {
    /// Build the variant matching a classified transport failure.
    pub fn transport(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            FailureKind::Timeout => LabError::Timeout(message),
            FailureKind::ConnectionRefused => LabError::ConnectionRefused(message),
            FailureKind::AuthFailed => LabError::AuthFailed(message),
            FailureKind::ConnectionError => LabError::ConnectionError(message),
            FailureKind::RemoteError => LabError::Remote(message),
            FailureKind::LocalError => LabError::InvalidRequest(message),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LabError::Timeout(_) => ErrorKind::Timeout,
            LabError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            LabError::AuthFailed(_) => ErrorKind::AuthFailed,
            LabError::ConnectionError(_) => ErrorKind::ConnectionError,
            LabError::Remote(_) => ErrorKind::RemoteError,
            LabError::DeviceNotFound(_) => ErrorKind::DeviceNotFound,
            LabError::CacheCorrupt { .. } => ErrorKind::CacheCorrupt,
            LabError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            LabError::Config(_)
            | LabError::Internal(_)
            | LabError::Io(_)
            | LabError::Serialization(_) => ErrorKind::Internal,
        }
    }
}
