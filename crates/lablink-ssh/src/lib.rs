//! # LabLink – SSH
//!
//! Transport layer for lab devices, built on libssh2:
//!   • One multiplexed session per `(device, ip, port, user)` in a shared pool
//!   • Ordered credential fallback: key, cached password, device-class default
//!   • Command execution and SCP transfers over pooled or direct sessions
//!   • Failure classification into timeout / refused / auth / connection

pub mod ssh;
