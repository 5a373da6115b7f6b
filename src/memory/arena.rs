//! # Pooled Arena
//!
//! Cluster-granularity byte-pool allocator for resident region contents.
//!
//! ## Why a Pool?
//!
//! A captured trace creates and drops thousands of small-to-medium buffer
//! copies as regions move in and out of the recency cache. Routing those
//! through the global allocator causes churn and fragmentation exactly in
//! the hot capture path. The arena instead carves one fixed allocation into
//! fixed-size clusters (default 1 KiB) and hands out runs of them:
//!
//! ```text
//! PooledArena
//! ├── memory:  [ c0 | c1 | c2 | c3 | c4 | c5 | ... ]   one Box<[u8]>
//! ├── bitmap:  [ 1  | 1  | 0  | 0  | 0  | 1  | ... ]   1 = free
//! └── slots:   [ Pooled{start:2, len:2600} | Free | ... ]  bounded handles
//! ```
//!
//! Allocation is a first-fit linear scan for a run of free clusters; frees
//! mark the run free again. Runs are requested together and freed together,
//! so no coalescing pass is needed and no defragmentation is performed.
//!
//! ## Fallback Mode
//!
//! [`PooledArena::unpooled`] builds an arena that passes every allocation
//! through the ordinary heap with unbounded handles. Stores default to this
//! mode, so nothing needs pool configuration up front; tests and small
//! tools can ignore sizing entirely.
//!
//! ## Failure Model
//!
//! A pooled arena that cannot place a run, or has no free handle slot,
//! fails the allocation with [`StoreError::OutOfMemory`]. Falling back to
//! the heap at that point would corrupt the size accounting the pool
//! exists to provide, so exhaustion is fatal to the calling operation.

use eyre::{ensure, Result};

use crate::error::StoreError;

/// Opaque handle to one live arena allocation.
///
/// Handles are only meaningful against the arena that issued them.
/// Accessing or freeing a handle twice is a caller bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaHandle(u32);

#[derive(Debug)]
enum Slot {
    Free,
    Pooled { start: usize, len: usize },
    Heap(Box<[u8]>),
}

#[derive(Debug)]
struct Pool {
    memory: Box<[u8]>,
    cluster_bytes: usize,
    /// One flag per cluster, `true` = free.
    bitmap: Vec<bool>,
}

impl Pool {
    /// First-fit scan for `want` consecutive free clusters. On success the
    /// run is marked used and its first cluster index returned.
    fn claim_run(&mut self, want: usize) -> Option<usize> {
        let mut run = 0;
        let mut start = 0;
        for i in 0..self.bitmap.len() {
            if self.bitmap[i] {
                run += 1;
                if run == want {
                    for flag in &mut self.bitmap[start..start + want] {
                        *flag = false;
                    }
                    return Some(start);
                }
            } else {
                run = 0;
                start = i + 1;
            }
        }
        None
    }

    fn release_run(&mut self, start: usize, count: usize) {
        for flag in &mut self.bitmap[start..start + count] {
            debug_assert!(!*flag, "releasing a cluster that is already free");
            *flag = true;
        }
    }

    fn clusters_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.cluster_bytes)
    }
}

/// Utilization snapshot of a [`PooledArena`].
#[derive(Debug, Clone)]
pub struct ArenaStats {
    pub live_handles: usize,
    /// Handle slot capacity; 0 for an unpooled arena (unbounded).
    pub max_handles: usize,
    pub used_clusters: usize,
    pub total_clusters: usize,
    pub cluster_bytes: usize,
    /// Sum of live allocation lengths (requested bytes, not cluster bytes).
    pub live_bytes: usize,
}

impl std::fmt::Display for ArenaStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "handles:{}/{},clusters:{}/{},bytes:{}",
            self.live_handles, self.max_handles, self.used_clusters, self.total_clusters,
            self.live_bytes
        )
    }
}

/// Fixed-capacity cluster allocator with a heap-passthrough fallback mode.
#[derive(Debug)]
pub struct PooledArena {
    pool: Option<Pool>,
    slots: Vec<Slot>,
    live: usize,
}

impl PooledArena {
    /// Build a pooled arena: `pool_bytes` of backing memory divided into
    /// `cluster_bytes` clusters, with at most `max_handles` live
    /// allocations.
    pub fn with_pool(pool_bytes: usize, cluster_bytes: usize, max_handles: usize) -> Result<Self> {
        ensure!(cluster_bytes > 0, "cluster size must be nonzero");
        ensure!(pool_bytes > 0, "pool size must be nonzero");
        ensure!(
            pool_bytes % cluster_bytes == 0,
            "pool size {} is not a multiple of cluster size {}",
            pool_bytes,
            cluster_bytes
        );
        ensure!(max_handles > 0, "handle capacity must be nonzero");

        Ok(Self {
            pool: Some(Pool {
                memory: vec![0u8; pool_bytes].into_boxed_slice(),
                cluster_bytes,
                bitmap: vec![true; pool_bytes / cluster_bytes],
            }),
            slots: (0..max_handles).map(|_| Slot::Free).collect(),
            live: 0,
        })
    }

    /// Build a passthrough arena: every allocation is an ordinary heap
    /// buffer and the handle count is unbounded.
    pub fn unpooled() -> Self {
        Self {
            pool: None,
            slots: Vec::new(),
            live: 0,
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Allocate `bytes` zeroed bytes.
    pub fn allocate(&mut self, bytes: usize) -> Result<ArenaHandle> {
        ensure!(bytes > 0, "zero-length arena allocation");

        let slot = match self.find_free_slot() {
            Some(slot) => slot,
            None => eyre::bail!(StoreError::OutOfMemory {
                requested: bytes,
                detail: "no free handle slot",
            }),
        };

        match &mut self.pool {
            Some(pool) => {
                let want = pool.clusters_for(bytes);
                let start = match pool.claim_run(want) {
                    Some(start) => start,
                    None => eyre::bail!(StoreError::OutOfMemory {
                        requested: bytes,
                        detail: "no run of free clusters long enough",
                    }),
                };
                // Runs are recycled without scrubbing; hand out zeroed bytes.
                let base = start * pool.cluster_bytes;
                pool.memory[base..base + bytes].fill(0);
                self.slots[slot] = Slot::Pooled { start, len: bytes };
            }
            None => {
                self.slots[slot] = Slot::Heap(vec![0u8; bytes].into_boxed_slice());
            }
        }

        self.live += 1;
        Ok(ArenaHandle(slot as u32))
    }

    /// Allocate and fill with a copy of `data`.
    pub fn allocate_copy(&mut self, data: &[u8]) -> Result<ArenaHandle> {
        let handle = self.allocate(data.len())?;
        self.bytes_mut(handle).copy_from_slice(data);
        Ok(handle)
    }

    /// Release an allocation. The handle must be live.
    pub fn free(&mut self, handle: ArenaHandle) {
        let slot = handle.0 as usize;
        match std::mem::replace(&mut self.slots[slot], Slot::Free) {
            Slot::Pooled { start, len } => {
                let pool = self.pool.as_mut().expect("pooled slot without a pool"); // INVARIANT: Pooled slots only exist in pooled arenas
                let count = pool.clusters_for(len);
                pool.release_run(start, count);
            }
            Slot::Heap(_) => {}
            Slot::Free => panic!("double free of arena handle {}", handle.0),
        }
        self.live -= 1;
    }

    pub fn bytes(&self, handle: ArenaHandle) -> &[u8] {
        match &self.slots[handle.0 as usize] {
            Slot::Pooled { start, len } => {
                let pool = self.pool.as_ref().expect("pooled slot without a pool"); // INVARIANT
                let base = start * pool.cluster_bytes;
                &pool.memory[base..base + len]
            }
            Slot::Heap(data) => data,
            Slot::Free => panic!("stale arena handle {}", handle.0),
        }
    }

    pub fn bytes_mut(&mut self, handle: ArenaHandle) -> &mut [u8] {
        match &mut self.slots[handle.0 as usize] {
            Slot::Pooled { start, len } => {
                let pool = self.pool.as_mut().expect("pooled slot without a pool"); // INVARIANT
                let base = *start * pool.cluster_bytes;
                &mut pool.memory[base..base + *len]
            }
            Slot::Heap(data) => data,
            Slot::Free => panic!("stale arena handle {}", handle.0),
        }
    }

    pub fn live_handles(&self) -> usize {
        self.live
    }

    pub fn stats(&self) -> ArenaStats {
        let live_bytes = self
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Pooled { len, .. } => *len,
                Slot::Heap(data) => data.len(),
                Slot::Free => 0,
            })
            .sum();

        match &self.pool {
            Some(pool) => ArenaStats {
                live_handles: self.live,
                max_handles: self.slots.len(),
                used_clusters: pool.bitmap.iter().filter(|free| !**free).count(),
                total_clusters: pool.bitmap.len(),
                cluster_bytes: pool.cluster_bytes,
                live_bytes,
            },
            None => ArenaStats {
                live_handles: self.live,
                max_handles: 0,
                used_clusters: 0,
                total_clusters: 0,
                cluster_bytes: 0,
                live_bytes,
            },
        }
    }

    fn find_free_slot(&mut self) -> Option<usize> {
        if let Some(idx) = self.slots.iter().position(|slot| matches!(slot, Slot::Free)) {
            return Some(idx);
        }
        if self.pool.is_none() {
            // Unpooled arenas grow the slot table on demand.
            self.slots.push(Slot::Free);
            return Some(self.slots.len() - 1);
        }
        None
    }
}

impl Default for PooledArena {
    fn default() -> Self {
        Self::unpooled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    fn unpooled_allocates_and_frees() {
        let mut arena = PooledArena::unpooled();
        assert!(!arena.is_pooled());

        let handle = arena.allocate_copy(b"hello").unwrap();
        assert_eq!(arena.bytes(handle), b"hello");
        assert_eq!(arena.live_handles(), 1);

        arena.free(handle);
        assert_eq!(arena.live_handles(), 0);
    }

    #[test]
    fn pooled_rounds_up_to_clusters() {
        let mut arena = PooledArena::with_pool(8 * 64, 64, 8).unwrap();
        let handle = arena.allocate(65).unwrap();

        let stats = arena.stats();
        assert_eq!(stats.used_clusters, 2, "65 bytes SHOULD claim two 64-byte clusters");
        assert_eq!(arena.bytes(handle).len(), 65);
    }

    #[test]
    fn first_fit_reuses_freed_run() {
        let mut arena = PooledArena::with_pool(4 * 64, 64, 8).unwrap();
        let a = arena.allocate(64).unwrap();
        let _b = arena.allocate(64).unwrap();

        arena.free(a);
        let c = arena.allocate_copy(&[7u8; 64]).unwrap();

        // The freed first cluster is the first fit for the new run.
        assert_eq!(arena.bytes(c)[0], 7);
        assert_eq!(arena.stats().used_clusters, 2);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let mut arena = PooledArena::with_pool(2 * 64, 64, 8).unwrap();
        let _a = arena.allocate(128).unwrap();

        let err = arena.allocate(1).unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::OutOfMemory { requested, .. }) => assert_eq!(*requested, 1),
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
    }

    #[test]
    fn fragmentation_without_long_run_fails() {
        let mut arena = PooledArena::with_pool(3 * 64, 64, 8).unwrap();
        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();
        let _c = arena.allocate(64).unwrap();

        arena.free(a);
        arena.free(b);

        // Two free clusters remain and they are adjacent, so a two-cluster
        // run fits but a three-cluster run does not.
        assert!(arena.allocate(128).is_ok());
        assert!(arena.allocate(64).is_err());
    }

    #[test]
    fn handle_slots_bound_live_allocations() {
        let mut arena = PooledArena::with_pool(8 * 64, 64, 2).unwrap();
        let _a = arena.allocate(64).unwrap();
        let _b = arena.allocate(64).unwrap();

        let err = arena.allocate(64).unwrap_err();
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::OutOfMemory { detail, .. }) => {
                assert!(detail.contains("handle slot"));
            }
            other => panic!("expected OutOfMemory, got {:?}", other),
        }
    }

    #[test]
    fn recycled_run_is_zeroed() {
        let mut arena = PooledArena::with_pool(2 * 64, 64, 4).unwrap();
        let a = arena.allocate_copy(&[0xFFu8; 64]).unwrap();
        arena.free(a);

        let b = arena.allocate(64).unwrap();
        assert!(arena.bytes(b).iter().all(|&byte| byte == 0));
    }

    #[test]
    fn stats_display_is_compact() {
        let mut arena = PooledArena::with_pool(4 * 64, 64, 8).unwrap();
        let _a = arena.allocate(100).unwrap();

        let text = arena.stats().to_string();
        assert!(text.contains("handles:1/8"));
        assert!(text.contains("clusters:2/4"));
    }

    #[test]
    #[should_panic(expected = "stale arena handle")]
    fn stale_handle_access_panics() {
        let mut arena = PooledArena::unpooled();
        let handle = arena.allocate(4).unwrap();
        arena.free(handle);
        let _ = arena.bytes(handle);
    }
}
