//! # Memory Management
//!
//! This module provides the pooled arena backing resident region contents.
//!
//! Region contents cycle in and out of memory constantly as the recency
//! cache loads and evicts; the arena keeps that churn out of the global
//! allocator by serving copies from one fixed, cluster-granular pool. See
//! [`arena`] for the allocation strategy and the heap-passthrough fallback
//! used when no pool has been configured.
//!
//! The arena is an ordinary owned value: each `RegionStore` owns exactly
//! one, and region handles are only meaningful against the arena that
//! issued them. There is no process-global state.

mod arena;

pub use arena::{ArenaHandle, ArenaStats, PooledArena};
