//! # Descriptor Store Integration Tests
//!
//! End-to-end coverage of the capture → replay cycle:
//!
//! 1. A full Storing session (immediate commits, deferred descriptors,
//!    group binding) reloaded in Loading mode returns identical contents
//!    and keeps every bound descriptor inside its region.
//! 2. Deferred records in the directory are accepted exactly when the
//!    store tolerates them.
//! 3. Group binding over contiguous address ranges produces one merged
//!    region.

use tempfile::tempdir;
use tracebuf::{DescriptorStore, Mode, StoreError};

mod capture_replay_tests {
    use super::*;

    #[test]
    fn full_session_roundtrips_through_loading_mode() {
        let dir = tempdir().unwrap();
        let desc_path = dir.path().join("trace.desc");
        let mem_path = dir.path().join("trace.mem");

        let (bound_a, bound_b, grouped_lo, grouped_hi, deferred) = {
            let mut store = DescriptorStore::builder()
                .tolerate_deferred(true)
                .cache_capacity(2)
                .open(&desc_path, &mem_path, Mode::Storing)
                .unwrap();

            let bound_a = store.create(Some(0x4000), Some(b"index data")).unwrap();
            let bound_b = store.create(Some(0x5000), Some(b"texture rows")).unwrap();

            let grouped_lo = store.create(Some(0x100), None).unwrap();
            let grouped_hi = store.create(Some(0x110), None).unwrap();
            store.set_size(grouped_lo, 16).unwrap();
            store.set_size(grouped_hi, 16).unwrap();
            store
                .bind_group(&[grouped_lo, grouped_hi], |_, len| {
                    Ok((0..len).map(|i| i as u8).collect())
                })
                .unwrap();

            let deferred = store.create(Some(0x9000), None).unwrap();

            store.close().unwrap();
            (bound_a, bound_b, grouped_lo, grouped_hi, deferred)
        };

        let mut store = DescriptorStore::builder()
            .tolerate_deferred(true)
            .open(&desc_path, &mem_path, Mode::Loading)
            .unwrap();

        assert_eq!(store.len(), 5);
        assert_eq!(store.deferred_len(), 1);

        assert_eq!(store.bytes(bound_a).unwrap().unwrap(), b"index data");
        assert_eq!(store.bytes(bound_b).unwrap().unwrap(), b"texture rows");

        assert_eq!(
            store.bytes(grouped_lo).unwrap().unwrap(),
            &(0..16).map(|i| i as u8).collect::<Vec<_>>()[..]
        );
        assert_eq!(
            store.bytes(grouped_hi).unwrap().unwrap(),
            &(16..32).map(|i| i as u8).collect::<Vec<_>>()[..]
        );

        assert!(store.find(deferred).unwrap().is_deferred());
        assert_eq!(
            store.bytes(deferred).unwrap(),
            None,
            "a tolerated deferred descriptor SHOULD read back as absent"
        );
    }

    #[test]
    fn bound_descriptors_stay_inside_their_regions() {
        let dir = tempdir().unwrap();
        let desc_path = dir.path().join("trace.desc");
        let mem_path = dir.path().join("trace.mem");

        {
            let mut store = DescriptorStore::open(&desc_path, &mem_path, Mode::Storing).unwrap();
            for i in 0u32..4 {
                let addr = 0x100 * (i + 1);
                store.create(Some(addr), None).unwrap();
                store.set_size(i, 32).unwrap();
            }
            store
                .bind_group(&[0, 1, 2, 3], |start, len| {
                    Ok((0..len).map(|i| ((start >> 4) as u8).wrapping_add(i as u8)).collect())
                })
                .unwrap();
            store.close().unwrap();
        }

        let store = DescriptorStore::open(&desc_path, &mem_path, Mode::Loading).unwrap();
        for id in 0u32..4 {
            let desc = store.find(id).unwrap();
            let region = store
                .region_store()
                .region(desc.region_id().unwrap())
                .unwrap();
            assert!(
                desc.offset() + desc.size() <= region.size(),
                "descriptor {} SHOULD fit inside region {}",
                id,
                region.id()
            );
        }
    }

    #[test]
    fn loading_rejects_records_pointing_past_their_region() {
        let dir = tempdir().unwrap();
        let desc_path = dir.path().join("trace.desc");
        let mem_path = dir.path().join("trace.mem");

        // One 8-byte region at address 0x1000.
        let mut mem = Vec::new();
        mem.extend_from_slice(&0u32.to_le_bytes());
        mem.extend_from_slice(&0x1000u32.to_le_bytes());
        mem.extend_from_slice(&8u32.to_le_bytes());
        mem.extend_from_slice(b"contents");
        std::fs::write(&mem_path, &mem).unwrap();

        // A descriptor claiming 8 bytes at 0x1004 overruns it.
        let mut desc = Vec::new();
        desc.extend_from_slice(&0u32.to_le_bytes());
        desc.extend_from_slice(&0x1004u32.to_le_bytes());
        desc.extend_from_slice(&8u32.to_le_bytes());
        desc.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&desc_path, &desc).unwrap();

        let err = DescriptorStore::open(&desc_path, &mem_path, Mode::Loading).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound { .. })
        ));
    }
}

mod deferred_directory_tests {
    use super::*;

    fn write_deferred_fixture(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let desc_path = dir.join("trace.desc");
        let mem_path = dir.join("trace.mem");

        // {id=0, legacy_address=0x1000, size=0, region_id=0}
        let mut record = Vec::new();
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&0x1000u32.to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(&desc_path, &record).unwrap();
        std::fs::write(&mem_path, b"").unwrap();

        (desc_path, mem_path)
    }

    #[test]
    fn tolerant_store_loads_deferred_records() {
        let dir = tempdir().unwrap();
        let (desc_path, mem_path) = write_deferred_fixture(dir.path());

        let store = DescriptorStore::builder()
            .tolerate_deferred(true)
            .open(&desc_path, &mem_path, Mode::Loading)
            .unwrap();

        let desc = store.find(0).unwrap();
        assert!(desc.is_deferred());
        assert_eq!(desc.legacy_address(), 0x1000);
        assert_eq!(desc.size(), 0);
    }

    #[test]
    fn strict_store_rejects_deferred_records() {
        let dir = tempdir().unwrap();
        let (desc_path, mem_path) = write_deferred_fixture(dir.path());

        let err = DescriptorStore::builder()
            .tolerate_deferred(false)
            .open(&desc_path, &mem_path, Mode::Loading)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotBound { id: 0 })
        ));
    }

    #[test]
    fn deferred_record_with_region_id_is_corrupt() {
        let dir = tempdir().unwrap();
        let desc_path = dir.path().join("trace.desc");
        let mem_path = dir.path().join("trace.mem");

        let mut record = Vec::new();
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&0x1000u32.to_le_bytes());
        record.extend_from_slice(&0u32.to_le_bytes());
        record.extend_from_slice(&5u32.to_le_bytes()); // must be 0 when size is 0
        std::fs::write(&desc_path, &record).unwrap();
        std::fs::write(&mem_path, b"").unwrap();

        let err = DescriptorStore::builder()
            .tolerate_deferred(true)
            .open(&desc_path, &mem_path, Mode::Loading)
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound { .. })
        ));
    }
}

mod group_binding_tests {
    use super::*;

    #[test]
    fn contiguous_ranges_merge_into_one_region() {
        let dir = tempdir().unwrap();
        let mut store = DescriptorStore::open(
            dir.path().join("trace.desc"),
            dir.path().join("trace.mem"),
            Mode::Storing,
        )
        .unwrap();

        let lo = store.create(Some(0x100), None).unwrap();
        let hi = store.create(Some(0x110), None).unwrap();
        store.set_size(lo, 16).unwrap();
        store.set_size(hi, 16).unwrap();

        store
            .bind_group(&[lo, hi], |start, len| {
                assert_eq!((start, len), (0x100, 32));
                Ok(vec![0x5A; len as usize])
            })
            .unwrap();

        let region_id = store.find(lo).unwrap().region_id().unwrap();
        assert_eq!(store.find(hi).unwrap().region_id(), Some(region_id));

        let region = store.region_store().region(region_id).unwrap();
        assert_eq!(region.size(), 32, "the merged span [0x100, 0x11F] is 32 bytes");
        assert_eq!(region.legacy_address(), 0x100);

        store.close().unwrap();
    }

    #[test]
    fn overlapping_ranges_share_one_span() {
        let dir = tempdir().unwrap();
        let mut store = DescriptorStore::open(
            dir.path().join("trace.desc"),
            dir.path().join("trace.mem"),
            Mode::Storing,
        )
        .unwrap();

        // Interleaved attributes: positions at 0x100 stride into the same
        // span as colors at 0x10C.
        let positions = store.create(Some(0x100), None).unwrap();
        let colors = store.create(Some(0x10C), None).unwrap();
        store.set_size(positions, 24).unwrap();
        store.set_size(colors, 24).unwrap();

        store
            .bind_group(&[positions, colors], |start, len| {
                assert_eq!(start, 0x100);
                assert_eq!(len, 0x24); // [0x100, 0x123]
                Ok((0..len).map(|i| i as u8).collect())
            })
            .unwrap();

        assert_eq!(store.find(positions).unwrap().offset(), 0);
        assert_eq!(store.find(colors).unwrap().offset(), 0xC);
        assert_eq!(
            store.bytes(colors).unwrap().unwrap(),
            &(0xC..0xC + 24).map(|i| i as u8).collect::<Vec<_>>()[..]
        );

        store.close().unwrap();
    }

    #[test]
    fn group_regions_dedup_across_draws() {
        let dir = tempdir().unwrap();
        let mut store = DescriptorStore::open(
            dir.path().join("trace.desc"),
            dir.path().join("trace.mem"),
            Mode::Storing,
        )
        .unwrap();

        // The same vertex array is re-registered for a second draw call
        // with unchanged memory; the span dedups to the first region.
        let payload = |_, len: u32| Ok(vec![0x11u8; len as usize]);

        let first = store.create(Some(0x200), None).unwrap();
        store.set_size(first, 64).unwrap();
        store.bind_group(&[first], payload).unwrap();

        let second = store.create(Some(0x200), None).unwrap();
        store.set_size(second, 64).unwrap();
        store.bind_group(&[second], payload).unwrap();

        assert_eq!(
            store.find(first).unwrap().region_id(),
            store.find(second).unwrap().region_id(),
        );
        assert_eq!(store.region_store().len(), 1);

        store.close().unwrap();
    }
}
