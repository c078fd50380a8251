// ── Connection pool – one live multiplexed session per key ───────────────────
//
// Each key owns a slot.  Establishment happens while holding that slot's lock,
// so two callers racing on the same key end up sharing one session, while
// different keys connect in parallel.  Handles are never released by callers;
// a dead session is replaced on the next acquire.

use super::transport::{Connector, RemoteSession};
use super::types::*;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionKey {
    pub device_id: String,
    pub ip: String,
    pub port: u16,
    pub username: String,
}

impl ConnectionKey {
    pub fn new(device_id: &str, ip: &str, port: u16, username: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            ip: ip.to_string(),
            port,
            username: username.to_string(),
        }
    }

    pub fn target(&self) -> SshTarget {
        SshTarget::new(self.ip.clone(), self.port)
    }
}

pub struct ConnectionHandle {
    id: String,
    key: ConnectionKey,
    session: Arc<dyn RemoteSession>,
    created_at: DateTime<Utc>,
}

impl ConnectionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }
    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

type Slot = Arc<Mutex<Option<Arc<ConnectionHandle>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    timeouts: SessionTimeouts,
    slots: Mutex<HashMap<ConnectionKey, Slot>>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, timeouts: SessionTimeouts) -> Self {
        Self {
            connector,
            timeouts,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &ConnectionKey) -> Slot {
        lock(&self.slots).entry(key.clone()).or_default().clone()
    }

    /// The live handle for `key`, establishing a key-authenticated session if needed.
    pub fn acquire(&self, key: &ConnectionKey) -> Result<Arc<ConnectionHandle>, SshFailure> {
        let slot = self.slot(key);
        let mut current = lock(&slot);

        if let Some(handle) = current.as_ref() {
            if handle.session.is_alive() {
                return Ok(Arc::clone(handle));
            }
            log::info!(
                "Pooled session to {}@{}:{} died, reconnecting",
                key.username,
                key.ip,
                key.port
            );
            handle.session.close();
            *current = None;
        }

        let session = self
            .connector
            .connect(&key.target(), &AuthAttempt::key(&key.username), self.timeouts)?;
        let handle = Arc::new(ConnectionHandle {
            id: Uuid::new_v4().to_string(),
            key: key.clone(),
            session,
            created_at: Utc::now(),
        });
        log::info!(
            "Pooled session {} opened for {} ({}@{}:{})",
            handle.id,
            key.device_id,
            key.username,
            key.ip,
            key.port
        );
        *current = Some(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn is_alive(&self, handle: &ConnectionHandle) -> bool {
        handle.session.is_alive()
    }

    /// Tear down the session for `key`. Returns whether one was open.
    pub fn evict(&self, key: &ConnectionKey) -> bool {
        let slot = match lock(&self.slots).get(key) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        let taken = lock(&slot).take();
        match taken {
            Some(handle) => {
                handle.session.close();
                log::info!("Evicted pooled session {} for {}", handle.id, key.device_id);
                true
            }
            None => false,
        }
    }

    /// Evict `handle` only if it is still the pooled one for its key.
    pub fn evict_handle(&self, handle: &ConnectionHandle) -> bool {
        let slot = match lock(&self.slots).get(&handle.key) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        let mut current = lock(&slot);
        if current.as_ref().map(|h| h.id == handle.id).unwrap_or(false) {
            *current = None;
            handle.session.close();
            log::info!("Evicted broken session {} for {}", handle.id, handle.key.device_id);
            true
        } else {
            false
        }
    }

    /// Close every pooled session.
    pub fn shutdown(&self) -> usize {
        let slots: Vec<Slot> = lock(&self.slots).drain().map(|(_, s)| s).collect();
        let mut closed = 0;
        for slot in slots {
            if let Some(handle) = lock(&slot).take() {
                handle.session.close();
                closed += 1;
            }
        }
        if closed > 0 {
            log::info!("Connection pool shut down, {} session(s) closed", closed);
        }
        closed
    }

    /// Number of keys currently holding a session.
    pub fn len(&self) -> usize {
        let slots: Vec<Slot> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter(|s| lock(s).is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
