//! # LabLink
//!
//! Device identity and connection management for lab test automation:
//!   • Resolve a device reference to its current address under DHCP churn
//!   • Verify that the unit answering at an address is the expected one
//!   • Durable identity cache with bounded staleness
//!   • One multiplexed SSH session per device, with a credential fallback chain
//!   • Command execution, file transfer and directory sync on top of it
//!   • A JSON-lines command protocol for an external orchestrator

pub mod commands;
pub mod logging;
pub mod report;
pub mod service;
pub mod transfer;

pub use lablink_core as core;
pub use lablink_credentials as credentials;
pub use lablink_identity::identity;
pub use lablink_ssh::ssh;

pub use report::{OperationReport, ReportError};
pub use service::LabService;
