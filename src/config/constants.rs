//! # Configuration Constants
//!
//! This module centralizes the tunable values and on-disk record sizes used
//! across tracebuf. Interdependent values are co-located and guarded by
//! compile-time assertions so they cannot drift apart.
//!
//! ## Dependency Graph
//!
//! ```text
//! REGION_RECORD_HEADER_SIZE (12 bytes)
//!       │
//!       └─> Region file layout: each record is 12 + size bytes, back to
//!           back with no padding. Readers reconstruct file offsets by
//!           walking the stream, so this value is part of the wire format
//!           and can never change.
//!
//! DESCRIPTOR_RECORD_SIZE (16 bytes)
//!       │
//!       └─> Descriptor directory layout: fixed-size records, so record N
//!           lives at byte offset N * 16.
//!
//! DEFAULT_POOL_BYTES (8 MiB)
//!       │
//!       ├─> Must be a multiple of DEFAULT_CLUSTER_BYTES (enforced below).
//!       │
//!       └─> DEFAULT_ARENA_HANDLES bounds live allocations; with 1 KiB
//!           clusters and 4096 handles the pool cannot be fragmented into
//!           more live buffers than it has handle slots for.
//! ```
//!
//! ## Sizing Notes
//!
//! - `DEFAULT_CACHE_CAPACITY`: number of regions with resident content.
//!   Captured traces routinely reference a handful of hot buffers (current
//!   vertex arrays, active textures) between draw calls; ten residents
//!   covers that working set while keeping replay memory flat.
//! - `DEFAULT_CLUSTER_BYTES`: pooled-arena granularity. Most captured
//!   buffers are a few KiB, so 1 KiB clusters waste little and keep the
//!   first-fit bitmap scan short.

/// Fixed header of every region record: `{id, legacy_address, size}` as
/// three little-endian u32 words. Payload bytes follow immediately.
pub const REGION_RECORD_HEADER_SIZE: usize = 12;

/// Fixed size of a descriptor directory record:
/// `{id, legacy_address, size, region_id}`.
pub const DESCRIPTOR_RECORD_SIZE: usize = 16;

/// Default bound on regions with resident content.
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

/// Default pooled-arena cluster granularity.
pub const DEFAULT_CLUSTER_BYTES: usize = 1024;

/// Default pooled-arena capacity.
pub const DEFAULT_POOL_BYTES: usize = 8 * 1024 * 1024;

/// Default bound on live pooled-arena handles.
pub const DEFAULT_ARENA_HANDLES: usize = 4096;

const _: () = assert!(
    DEFAULT_POOL_BYTES % DEFAULT_CLUSTER_BYTES == 0,
    "arena pool must be a whole number of clusters"
);

const _: () = assert!(DEFAULT_CACHE_CAPACITY >= 1, "the recency cache cannot be empty");

const _: () = assert!(DEFAULT_ARENA_HANDLES >= 1);
