//! # Storage Module
//!
//! The region layer of tracebuf: deduplicated content blocks, their
//! checksum index, the bounded recency cache, and the backing region file.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                RegionStore                    │
//! │  directory: Vec<Region>    (id == position)   │
//! │  checksum index (write mode only)             │
//! │  recency cache (bounded, LRU, write-back)     │
//! ├───────────────────────────────────────────────┤
//! │  PooledArena   │   backing region file        │
//! │  resident copies │ append-layout records      │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! The capture tool opens the store read-write and funnels every buffer
//! upload through [`RegionStore::create`], which stores each distinct byte
//! content exactly once. The replay tool opens the same file read-only and
//! pulls contents back by id through [`RegionStore::content`]; only a
//! bounded working set is ever resident.
//!
//! ## Module Organization
//!
//! - [`checksum`]: the legacy 16-bit-word bucket checksum
//! - `region`: the [`Region`] directory entry
//! - `store`: the [`RegionStore`] itself
//!
//! ## Mode Summary
//!
//! | operation          | `ReadWrite` (capture) | `ReadOnly` (replay) |
//! |--------------------|-----------------------|---------------------|
//! | `create`           | yes                   | fails               |
//! | `find_by_content`  | yes                   | fails (no index)    |
//! | `region` / `content` | yes                 | yes                 |
//! | record writes      | on eviction/flush     | never               |

pub mod checksum;
mod region;
mod store;

pub use checksum::content_checksum;
pub use region::Region;
pub use store::{RegionStore, RegionStoreOptions, RegionStoreStats, StoreMode};
