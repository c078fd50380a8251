// ── lablink-ssh / ssh module ──────────────────────────────────────────────────
//
//   • types      – targets, auth attempts, command output, failures
//   • transport  – the session/connector seam and its ssh2 implementation
//   • fallback   – ordered credential attempts for a direct session
//   • pool       – at most one live multiplexed session per key
//   • access     – pool first, direct session second

pub mod access;
pub mod fallback;
pub mod pool;
pub mod transport;
pub mod types;

pub use access::{AccessError, AccessOutcome, AccessRequest, DeviceAccess};
pub use fallback::{AttemptFailure, ChainRequest, Established, FallbackChain};
pub use pool::{ConnectionHandle, ConnectionKey, ConnectionPool};
pub use transport::{Connector, KeyAuthConfig, RemoteSession, Ssh2Connector, Ssh2Session};
pub use types::*;
