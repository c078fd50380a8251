// ── lablink-identity / identity module ───────────────────────────────────────
//
//   • types     – probe outcomes, match candidates, cache entries, results
//   • probe     – command strategies and the SSH-backed prober
//   • scoring   – pure scoring of observed facts against inventory records
//   • cache     – crash-safe JSON cache keyed by IP
//   • resolver  – resolve / identify / verify / update-ip

pub mod cache;
pub mod probe;
pub mod resolver;
pub mod scoring;
pub mod types;

pub use cache::IdentityCache;
pub use probe::{IdentityProber, ProbeTarget, SshIdentityProbe};
pub use resolver::IdentityResolver;
pub use types::*;
