// ── Device access – pooled session first, direct session second ──────────────

use super::fallback::{ChainRequest, FallbackChain};
use super::pool::{ConnectionKey, ConnectionPool};
use super::transport::{Connector, RemoteSession};
use super::types::*;
use lablink_core::FailureKind;
use std::sync::Arc;

/// Where and as whom to reach a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    /// Without a device id the pool is bypassed (e.g. probing an unknown IP).
    pub device_id: Option<String>,
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub device_class: Option<String>,
}

#[derive(Debug)]
pub struct AccessOutcome<T> {
    pub value: T,
    pub mode: ConnectionMode,
    pub auth: AuthKind,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{failure}")]
pub struct AccessError {
    pub failure: SshFailure,
    /// The username of the last attempt.
    pub username: String,
    /// Set when a session was obtained and the operation itself failed.
    pub mode: Option<ConnectionMode>,
}

pub struct DeviceAccess {
    connector: Arc<dyn Connector>,
    pool: ConnectionPool,
    chain: Arc<FallbackChain>,
    timeouts: SessionTimeouts,
}

impl DeviceAccess {
    pub fn new(
        connector: Arc<dyn Connector>,
        chain: Arc<FallbackChain>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(Arc::clone(&connector), timeouts),
            connector,
            chain,
            timeouts,
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn chain(&self) -> &FallbackChain {
        &self.chain
    }

    /// Run `op` against the device.
    ///
    /// The pooled key-authenticated session is used when it can be had.  If it
    /// cannot be established for a credential or generic connection reason, a
    /// direct session is opened through the fallback chain for this call only
    /// and closed afterwards.  Refusals and timeouts are not retried.
    ///
    /// A failed operation is retried direct only when it left the pooled
    /// session dead; otherwise the failure is the answer.
    pub fn with_session<T, F>(
        &self,
        request: &AccessRequest,
        op: F,
    ) -> Result<AccessOutcome<T>, AccessError>
    where
        F: Fn(&dyn RemoteSession) -> Result<T, SshFailure>,
    {
        let mut skip_key = false;

        if let Some(device_id) = request.device_id.as_deref() {
            let key = ConnectionKey::new(device_id, &request.ip, request.port, &request.username);
            match self.pool.acquire(&key) {
                Ok(handle) => match op(handle.session()) {
                    Ok(value) => {
                        return Ok(AccessOutcome {
                            value,
                            mode: ConnectionMode::Multiplexed,
                            auth: AuthKind::Key,
                            username: request.username.clone(),
                        })
                    }
                    Err(failure) if !handle.session().is_alive() => {
                        log::warn!(
                            "Pooled session for {} broke ({}), retrying direct",
                            device_id,
                            failure.message
                        );
                        self.pool.evict_handle(&handle);
                    }
                    Err(failure) => {
                        return Err(AccessError {
                            failure,
                            username: request.username.clone(),
                            mode: Some(ConnectionMode::Multiplexed),
                        })
                    }
                },
                Err(failure) => match failure.kind {
                    FailureKind::AuthFailed => {
                        log::debug!("Key auth refused for {}, using password chain", device_id);
                        skip_key = true;
                    }
                    FailureKind::ConnectionError
                    | FailureKind::RemoteError
                    | FailureKind::LocalError => {
                        log::debug!("Pool unavailable for {}: {}", device_id, failure.message);
                    }
                    FailureKind::Timeout | FailureKind::ConnectionRefused => {
                        return Err(AccessError {
                            failure,
                            username: request.username.clone(),
                            mode: None,
                        })
                    }
                },
            }
        }

        self.direct(request, skip_key, op)
    }

    fn direct<T, F>(
        &self,
        request: &AccessRequest,
        skip_key: bool,
        op: F,
    ) -> Result<AccessOutcome<T>, AccessError>
    where
        F: Fn(&dyn RemoteSession) -> Result<T, SshFailure>,
    {
        let target = SshTarget::new(request.ip.clone(), request.port);
        let chain_request = ChainRequest {
            device_id: request.device_id.as_deref(),
            target: &target,
            username: &request.username,
            device_class: request.device_class.as_deref(),
        };

        let connector = self.connector.as_ref();
        let established = if skip_key {
            self.chain
                .connect_without_key(connector, &chain_request, self.timeouts)
        } else {
            self.chain.connect(connector, &chain_request, self.timeouts)
        }
        .map_err(|f| AccessError {
            failure: f.failure,
            username: f.username,
            mode: None,
        })?;

        let result = op(established.session.as_ref());
        established.session.close();

        match result {
            Ok(value) => Ok(AccessOutcome {
                value,
                mode: ConnectionMode::Direct,
                auth: established.auth,
                username: established.username,
            }),
            Err(failure) => Err(AccessError {
                failure,
                username: established.username,
                mode: Some(ConnectionMode::Direct),
            }),
        }
    }
}
