use lablink_core::{ErrorKind, LabError};
use lablink_identity::identity::Resolution;
use lablink_ssh::ssh::{AccessError, AccessOutcome, AuthKind, ConnectionMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&LabError> for ReportError {
    fn from(err: &LabError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Uniform result of every public operation: outcome, typed error and the
/// context it ran in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport<T> {
    pub success: bool,
    pub device_id: Option<String>,
    pub ip: Option<String>,
    /// The username that ran the operation, or that last failed to log in.
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl<T> OperationReport<T> {
    pub fn new(device_id: Option<String>, ip: Option<String>, username: Option<String>) -> Self {
        Self {
            success: false,
            device_id,
            ip,
            username,
            connection: None,
            auth: None,
            data: None,
            error: None,
        }
    }

    pub fn for_target(target: &Resolution) -> Self {
        Self::new(
            Some(target.device_id.clone()),
            Some(target.ip.clone()),
            Some(target.username.clone()),
        )
    }

    pub fn succeed(mut self, data: T) -> Self {
        self.success = true;
        self.data = Some(data);
        self
    }

    pub fn fail(mut self, err: &LabError) -> Self {
        self.success = false;
        self.error = Some(ReportError::from(err));
        self
    }

    /// Fold the outcome of a device access into the report.
    pub fn from_access(mut self, result: Result<AccessOutcome<T>, AccessError>) -> Self {
        match result {
            Ok(outcome) => {
                self.connection = Some(outcome.mode);
                self.auth = Some(outcome.auth);
                self.username = Some(outcome.username);
                self.succeed(outcome.value)
            }
            Err(err) => {
                self.connection = err.mode;
                self.username = Some(err.username.clone());
                self.fail(&LabError::from(err.failure))
            }
        }
    }
}
