//! # LabLink – Credentials
//!
//! Username/secret pairs for lab devices:
//!   • A JSON-backed store keyed by device reference (device id or IP) and kind
//!   • Device-class default logins taken from the runtime configuration
//!   • The [`CredentialLookup`] seam consumed by the SSH fallback chain

pub mod defaults;
pub mod store;
pub mod types;

pub use defaults::DeviceClassDefaults;
pub use store::{CredentialLookup, CredentialStore};
pub use types::*;
