// ── Credential fallback chain ────────────────────────────────────────────────
//
// Attempt order for a direct session:
//   1. key authentication (agent, then key files)
//   2. the cached password for the device id, else for the IP
//   3. the device-class default, only when nothing is cached
// The first success wins; later links are never tried.

use super::transport::{Connector, RemoteSession};
use super::types::*;
use lablink_core::FailureKind;
use lablink_credentials::{CredentialKind, CredentialLookup, DeviceClassDefaults};
use std::sync::Arc;

/// What the chain needs to know about the device being reached.
#[derive(Debug, Clone, Copy)]
pub struct ChainRequest<'a> {
    pub device_id: Option<&'a str>,
    pub target: &'a SshTarget,
    pub username: &'a str,
    pub device_class: Option<&'a str>,
}

pub struct Established {
    pub session: Arc<dyn RemoteSession>,
    pub auth: AuthKind,
    pub username: String,
}

/// The classified failure of the last attempt made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub failure: SshFailure,
    pub username: String,
    pub auth: AuthKind,
}

pub struct FallbackChain {
    credentials: Arc<dyn CredentialLookup>,
    defaults: DeviceClassDefaults,
}

impl FallbackChain {
    pub fn new(credentials: Arc<dyn CredentialLookup>, defaults: DeviceClassDefaults) -> Self {
        Self {
            credentials,
            defaults,
        }
    }

    /// The ordered attempts for `request`.
    pub fn attempts(&self, request: &ChainRequest<'_>) -> Vec<AuthAttempt> {
        let mut attempts = vec![AuthAttempt::key(request.username)];

        let cached = request
            .device_id
            .and_then(|id| self.credentials.get_credential(id, CredentialKind::Ssh))
            .or_else(|| {
                self.credentials
                    .get_credential(&request.target.host, CredentialKind::Ssh)
            });

        match cached {
            Some(credential) => {
                // a cached entry without a password still rules out the default
                if credential.has_password() {
                    if let Some(secret) = credential.password {
                        attempts.push(AuthAttempt::password(
                            credential.username,
                            AuthKind::CachedPassword,
                            secret,
                        ));
                    }
                }
            }
            None => {
                if let Some(default) = self.defaults.for_class(request.device_class) {
                    if let Some(secret) = default.password {
                        attempts.push(AuthAttempt::password(
                            default.username,
                            AuthKind::DefaultPassword,
                            secret,
                        ));
                    }
                }
            }
        }
        attempts
    }

    /// Try every attempt in order until one yields a session.
    pub fn connect(
        &self,
        connector: &dyn Connector,
        request: &ChainRequest<'_>,
        timeouts: SessionTimeouts,
    ) -> Result<Established, AttemptFailure> {
        self.connect_with(connector, self.attempts(request), request, timeouts)
    }

    /// As [`connect`](Self::connect) but without the key link, for callers that
    /// already saw key authentication fail against this target.
    pub fn connect_without_key(
        &self,
        connector: &dyn Connector,
        request: &ChainRequest<'_>,
        timeouts: SessionTimeouts,
    ) -> Result<Established, AttemptFailure> {
        let attempts: Vec<AuthAttempt> = self
            .attempts(request)
            .into_iter()
            .filter(|a| a.kind != AuthKind::Key)
            .collect();
        if attempts.is_empty() {
            return Err(AttemptFailure {
                failure: SshFailure::new(
                    FailureKind::AuthFailed,
                    format!(
                        "{}@{}: Permission denied (publickey), no password credential",
                        request.username,
                        request.target.addr()
                    ),
                ),
                username: request.username.to_string(),
                auth: AuthKind::Key,
            });
        }
        self.connect_with(connector, attempts, request, timeouts)
    }

    fn connect_with(
        &self,
        connector: &dyn Connector,
        attempts: Vec<AuthAttempt>,
        request: &ChainRequest<'_>,
        timeouts: SessionTimeouts,
    ) -> Result<Established, AttemptFailure> {
        let mut last: Option<AttemptFailure> = None;

        for attempt in attempts {
            match connector.connect(request.target, &attempt, timeouts) {
                Ok(session) => {
                    if last.is_some() {
                        log::info!(
                            "{} reached as {} via {:?}",
                            request.target.addr(),
                            attempt.username,
                            attempt.kind
                        );
                    }
                    return Ok(Established {
                        session,
                        auth: attempt.kind,
                        username: attempt.username,
                    });
                }
                Err(failure) => {
                    log::debug!(
                        "{:?} attempt for {}@{} failed: {}",
                        attempt.kind,
                        attempt.username,
                        request.target.addr(),
                        failure
                    );
                    let refused = failure.kind == FailureKind::ConnectionRefused;
                    last = Some(AttemptFailure {
                        failure,
                        username: attempt.username,
                        auth: attempt.kind,
                    });
                    if refused {
                        break;
                    }
                }
            }
        }

        Err(last.unwrap_or_else(|| AttemptFailure {
            failure: SshFailure::new(FailureKind::ConnectionError, "no authentication attempts"),
            username: request.username.to_string(),
            auth: AuthKind::Key,
        }))
    }
}
