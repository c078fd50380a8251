//! # LabLink – Core
//!
//! Shared building blocks for the device identity and connection layer:
//!   • Failure taxonomy and text classification of transport errors
//!   • Runtime configuration with serde defaults and env overrides
//!   • Read-mostly device inventory with a single-field IP rewrite
//!   • Crash-safe JSON persistence helper

pub mod config;
pub mod error;
pub mod inventory;
pub mod persist;

pub use config::*;
pub use error::*;
pub use inventory::{DeviceRecord, Inventory, InventoryStore};
