//! # Region
//!
//! One deduplicated block of captured buffer content. A region is a data
//! holder: identity, length, the legacy address it was captured from, and
//! possibly-absent resident content in the owning store's arena. All cache
//! and file behavior lives in [`super::RegionStore`].

use eyre::{ensure, Result};

use crate::error::StoreError;
use crate::memory::{ArenaHandle, PooledArena};

/// A single content block in the region directory.
///
/// `content` is `None` while the block is evicted from the recency cache
/// (or not yet loaded in read-only mode); the bytes then live only in the
/// backing file at `file_offset`.
#[derive(Debug)]
pub struct Region {
    pub(crate) id: u32,
    pub(crate) legacy_address: u32,
    pub(crate) size: u32,
    pub(crate) content: Option<ArenaHandle>,
    pub(crate) file_offset: u32,
    pub(crate) persisted: bool,
}

impl Region {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The virtual address the content was captured from. Diagnostic only;
    /// never used for lookup.
    pub fn legacy_address(&self) -> u32 {
        self.legacy_address
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn file_offset(&self) -> u32 {
        self.file_offset
    }

    pub fn is_resident(&self) -> bool {
        self.content.is_some()
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Resident content from `offset` to the end of the region.
    ///
    /// Fails when `offset` is out of bounds. The caller must have made the
    /// region resident first; the store does this before delegating here.
    pub fn bytes<'a>(&self, arena: &'a PooledArena, offset: u32) -> Result<&'a [u8]> {
        ensure!(
            offset < self.size,
            StoreError::InvalidArguments {
                reason: format!(
                    "offset {} is outside region {} of {} bytes",
                    offset, self.id, self.size
                ),
            }
        );
        let handle = match self.content {
            Some(handle) => handle,
            None => eyre::bail!("region {} content is not resident", self.id),
        };
        Ok(&arena.bytes(handle)[offset as usize..])
    }

    /// Byte-exact comparison against `data` while resident.
    ///
    /// Returns `None` when the content is evicted; the store then compares
    /// against a scratch copy read from the backing file instead.
    pub fn matches(&self, arena: &PooledArena, data: &[u8]) -> Option<bool> {
        if data.len() != self.size as usize {
            return Some(false);
        }
        self.content.map(|handle| arena.bytes(handle) == data)
    }
}
