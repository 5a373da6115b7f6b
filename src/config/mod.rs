//! # tracebuf Configuration Module
//!
//! Centralizes configuration constants for tracebuf. Wire-format sizes and
//! default capacities live together here so interdependencies stay visible
//! and are enforced with compile-time assertions.
//!
//! Runtime configuration (cache capacity, deferred tolerance, arena sizing)
//! is set per store instance through [`crate::RegionStoreOptions`] and
//! [`crate::DescriptorStore::builder`]; the values in [`constants`] are the
//! defaults those surfaces start from.

pub mod constants;
pub use constants::*;
