//! # LabLink – Identity
//!
//! Knowing which physical unit answers at an address:
//!   • Ordered, retryable probe strategies with tagged outcomes
//!   • Pure hostname / hardware-id scoring against the inventory
//!   • Durable IP → identity cache with TTL and non-regressing merges
//!   • Resolver tying inventory, cache and probe together (resolve, identify,
//!     verify, verified IP update)

pub mod identity;
