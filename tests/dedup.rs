//! # Dedup Correctness Tests
//!
//! Coverage of the content-dedup contract:
//!
//! 1. Dedup idempotence: creating the same bytes twice in one write
//!    session returns the same id both times and appends exactly one
//!    record.
//! 2. The capacity-1 stress scenario: dedup still works when the first
//!    region's content has been evicted to disk.
//! 3. Checksum collisions never merge distinct contents.

use tempfile::tempdir;
use tracebuf::storage::content_checksum;
use tracebuf::{PooledArena, RegionStore, RegionStoreOptions, StoreMode};

fn open_write(path: &std::path::Path, capacity: usize) -> RegionStore {
    RegionStore::open_with(
        path,
        StoreMode::ReadWrite,
        RegionStoreOptions {
            cache_capacity: capacity,
            arena: PooledArena::unpooled(),
        },
    )
    .unwrap()
}

#[test]
fn create_is_idempotent_per_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.mem");

    {
        let mut store = open_write(&path, 4);
        let first = store.create(0x100, b"repeated upload").unwrap();
        let second = store.create(0x200, b"repeated upload").unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        store.close().unwrap();
    }

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(
        raw.len(),
        12 + b"repeated upload".len(),
        "exactly one record SHOULD be appended for duplicated content"
    );
}

#[test]
fn dedup_survives_eviction_with_capacity_one() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.mem");

    {
        let mut store = open_write(&path, 1);
        assert_eq!(store.create(0x100, b"AAAA").unwrap(), 0);
        assert_eq!(store.create(0x200, b"BBBB").unwrap(), 1);
        // The first region's content now lives only on disk; dedup must
        // still find it through the file compare.
        assert_eq!(store.create(0x300, b"AAAA").unwrap(), 0);
        assert_eq!(store.len(), 2);
        store.close().unwrap();
    }

    let raw = std::fs::read(&path).unwrap();
    assert_eq!(raw.len(), 2 * (12 + 4), "exactly two records SHOULD be on disk");

    let mut store = RegionStore::open(&path, StoreMode::ReadOnly).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.content(0).unwrap(), b"AAAA");
    assert_eq!(store.content(1).unwrap(), b"BBBB");
}

#[test]
fn colliding_checksums_store_distinct_regions() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.mem");

    // Both sum to 1 under the 16-bit-word checksum.
    let a = [0x01, 0x00, 0x00, 0x00];
    let b = [0x00, 0x00, 0x01, 0x00];
    assert_eq!(content_checksum(&a), content_checksum(&b));

    {
        let mut store = open_write(&path, 1);
        let id_a = store.create(0x10, &a).unwrap();
        let id_b = store.create(0x20, &b).unwrap();
        assert_ne!(id_a, id_b, "collisions MUST NOT merge distinct contents");

        // Re-creating either still dedups to the right id, even with both
        // candidates sharing one checksum bucket and one evicted.
        assert_eq!(store.create(0x30, &a).unwrap(), id_a);
        assert_eq!(store.create(0x40, &b).unwrap(), id_b);
        store.close().unwrap();
    }

    let mut store = RegionStore::open(&path, StoreMode::ReadOnly).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.content(0).unwrap(), &a);
    assert_eq!(store.content(1).unwrap(), &b);
}

#[test]
fn dedup_is_content_based_not_address_based() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.mem");

    let mut store = open_write(&path, 4);
    let first = store.create(0x1000, b"shared bytes").unwrap();
    // Same address, different content: a new region.
    let second = store.create(0x1000, b"other bytes!").unwrap();
    // Different address, same content: the old region.
    let third = store.create(0xFFFF_0000, b"shared bytes").unwrap();

    assert_ne!(first, second);
    assert_eq!(first, third);
    store.close().unwrap();
}
