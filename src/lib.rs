//! # tracebuf - Buffer Dedup Store for GPU Trace Capture/Replay
//!
//! tracebuf is the buffer storage core of a GPU command-trace toolchain.
//! Captured API calls reference large binary payloads (vertex data,
//! textures, shader programs); tracebuf stores each distinct byte content
//! exactly once, keeps only a bounded working set resident in memory, and
//! persists a stable on-disk layout that the replay tool reads back by
//! identifier.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tracebuf::{DescriptorStore, Mode};
//!
//! // Capture side: register buffers, dedup is automatic.
//! let mut store = DescriptorStore::builder()
//!     .cache_capacity(16)
//!     .open("trace.desc", "trace.mem", Mode::Storing)?;
//! let id = store.create(Some(0x8014_2000), Some(payload))?;
//! store.close()?;
//!
//! // Replay side: same files, contents on demand.
//! let mut store = DescriptorStore::open("trace.desc", "trace.mem", Mode::Loading)?;
//! let payload = store.bytes(id)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Capture / Replay tools (external)      │
//! ├─────────────────────────────────────────┤
//! │   DescriptorStore                        │
//! │   directory of buffer handles,           │
//! │   deferred binding, group commit         │
//! ├─────────────────────────────────────────┤
//! │   RegionStore                            │
//! │   content dedup (checksum + byte cmp),   │
//! │   bounded LRU of resident contents,      │
//! │   write-back to the region file          │
//! ├───────────────────┬─────────────────────┤
//! │   PooledArena     │   backing files     │
//! │   resident copies │   region + desc     │
//! └───────────────────┴─────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! trace.mem    # region file: {id, legacy_address, size} + payload, packed
//! trace.desc   # descriptor directory: fixed 16-byte records
//! ```
//!
//! ## Module Overview
//!
//! - [`descriptor`]: buffer handles, deferred binding, the public store
//! - [`storage`]: region directory, dedup index, recency cache, file I/O
//! - [`memory`]: cluster-pooled arena for resident contents
//! - [`config`]: wire sizes and default capacities
//! - [`error`]: the failure taxonomy ([`StoreError`])
//!
//! The whole crate is single-threaded by design: the capture interceptor
//! and the replay loop each own their store outright, and nothing here
//! suspends beyond ordinary file I/O.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod memory;
pub mod storage;

pub use descriptor::{Binding, Descriptor, DescriptorStore, DescriptorStoreBuilder, Mode};
pub use error::StoreError;
pub use memory::{ArenaHandle, ArenaStats, PooledArena};
pub use storage::{Region, RegionStore, RegionStoreOptions, RegionStoreStats, StoreMode};
