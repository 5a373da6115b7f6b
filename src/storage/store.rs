//! # Region Store
//!
//! Owns the region directory, the checksum-indexed dedup structure, the
//! bounded recency cache, and all backing-file I/O.
//!
//! ## File Format
//!
//! The backing file is a stream of variable-length records with no padding
//! and no separators:
//!
//! ```text
//! +--------------------------+----------------+--------------------------+ ...
//! | id | legacy_addr | size  | content        | id | legacy_addr | size  |
//! | (3 x u32 little-endian)  | (size bytes)   |                          |
//! +--------------------------+----------------+--------------------------+ ...
//! ```
//!
//! Read-only opens walk the stream once, recording each record's offset and
//! skipping its payload, so a replay tool starts up touching only 12 bytes
//! per region. Payloads are fetched on demand through the recency cache.
//!
//! ## Why Plain LRU with Write-Back?
//!
//! The toolchain is single-threaded and its access pattern is strongly
//! clustered: between two draw calls the same handful of buffers (current
//! vertex arrays, bound textures) is referenced over and over. A recency
//! list of a few entries captures that set exactly, and the scan-resistance
//! tricks of fancier policies buy nothing here. Entries are admitted at the
//! most-recent end; the least-recently-used entry is evicted when the bound
//! would be exceeded.
//!
//! Newly created regions are *not* written to the file immediately. Each
//! reserves its record offset from a monotone cursor at creation and is
//! written when it is evicted while dirty, when the cache is flushed or
//! shrunk, and at close. Eviction order need not match creation order, so
//! the writer seeks to the reserved offset instead of appending blindly;
//! offsets tile the file exactly, so a fully flushed file is identical to a
//! sequential append of the directory.
//!
//! ## Dedup Protocol
//!
//! `create` computes the content checksum and walks that bucket. Resident
//! candidates are compared in place; evicted candidates are compared
//! against a scratch copy read straight from the file, so a dedup probe
//! never disturbs the resident bound. Only a byte-exact match dedups —
//! the checksum is a bucket key, nothing more.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, eyre, Result, WrapErr};
use hashbrown::HashMap;
use smallvec::SmallVec;
use tracing::{debug, warn};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::checksum::content_checksum;
use super::region::Region;
use crate::config::{DEFAULT_CACHE_CAPACITY, REGION_RECORD_HEADER_SIZE};
use crate::error::StoreError;
use crate::memory::PooledArena;

/// Checksum buckets are almost always singletons; two inline slots cover
/// the occasional collision without spilling.
type Bucket = SmallVec<[u32; 2]>;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RegionRecordHeader {
    id: U32,
    legacy_address: U32,
    size: U32,
}

const _: () = assert!(std::mem::size_of::<RegionRecordHeader>() == REGION_RECORD_HEADER_SIZE);

impl RegionRecordHeader {
    fn new(id: u32, legacy_address: u32, size: u32) -> Self {
        Self {
            id: U32::new(id),
            legacy_address: U32::new(legacy_address),
            size: U32::new(size),
        }
    }
}

/// Whether a store serves an existing trace or records a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Replay: directory scanned from the file, contents loaded on demand,
    /// no checksum index, no mutation.
    ReadOnly,
    /// Capture: file truncated, records written back as the cache evicts.
    ReadWrite,
}

/// Construction-time configuration for a [`RegionStore`].
pub struct RegionStoreOptions {
    /// Bound on regions with resident content. Must be at least 1.
    pub cache_capacity: usize,
    /// Arena backing resident contents. Defaults to heap passthrough.
    pub arena: PooledArena,
}

impl Default for RegionStoreOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            arena: PooledArena::unpooled(),
        }
    }
}

/// Utilization snapshot of a [`RegionStore`].
#[derive(Debug, Clone)]
pub struct RegionStoreStats {
    pub regions: usize,
    pub resident: usize,
    pub cache_capacity: usize,
    /// Bytes of content currently resident.
    pub resident_bytes: u64,
    /// Bytes of content across the whole directory.
    pub total_bytes: u64,
}

impl std::fmt::Display for RegionStoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "regions:{},resident:{}/{},bytes:{}/{}",
            self.regions, self.resident, self.cache_capacity, self.resident_bytes,
            self.total_bytes
        )
    }
}

/// Deduplicating, file-backed directory of content regions.
#[derive(Debug)]
pub struct RegionStore {
    file: File,
    mode: StoreMode,
    regions: Vec<Region>,
    /// Built in write mode only; read-only opens never need content lookup.
    checksum_index: HashMap<u32, Bucket>,
    /// Region ids with resident content, most recently used first.
    recency: Vec<u32>,
    cache_capacity: usize,
    /// Next record offset in write mode.
    write_cursor: u32,
    arena: PooledArena,
    closed: bool,
}

impl RegionStore {
    /// Open with default options: heap-backed arena, default cache bound.
    pub fn open<P: AsRef<Path>>(path: P, mode: StoreMode) -> Result<Self> {
        Self::open_with(path, mode, RegionStoreOptions::default())
    }

    /// Open a region file.
    ///
    /// `ReadOnly` scans the existing directory without reading payloads and
    /// rejects structurally invalid files (zero-size records, id sequence
    /// gaps). `ReadWrite` truncates and starts an empty directory.
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        mode: StoreMode,
        options: RegionStoreOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        ensure!(options.cache_capacity >= 1, "cache capacity must be at least 1");

        let (file, regions) = match mode {
            StoreMode::ReadOnly => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .wrap_err_with(|| format!("failed to open region file {:?} read-only", path))?;
                let regions = Self::scan_directory(&mut file)?;
                (file, regions)
            }
            StoreMode::ReadWrite => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .wrap_err_with(|| format!("failed to create region file {:?}", path))?;
                (file, Vec::new())
            }
        };

        Ok(Self {
            file,
            mode,
            regions,
            checksum_index: HashMap::new(),
            recency: Vec::with_capacity(options.cache_capacity),
            cache_capacity: options.cache_capacity,
            write_cursor: 0,
            arena: options.arena,
            closed: false,
        })
    }

    /// Walk the record stream, validating structure and recording offsets.
    fn scan_directory(file: &mut File) -> Result<Vec<Region>> {
        let file_len = file
            .metadata()
            .wrap_err("failed to stat region file")?
            .len();

        let mut regions: Vec<Region> = Vec::new();
        let mut offset = 0u64;

        while offset < file_len {
            if offset + REGION_RECORD_HEADER_SIZE as u64 > file_len {
                // A crash mid-append leaves a partial header; everything
                // before it is intact.
                warn!(
                    offset,
                    trailing = file_len - offset,
                    "dropping partial region record header at end of file"
                );
                break;
            }

            file.seek(SeekFrom::Start(offset))
                .wrap_err("failed to seek region record header")?;
            let mut raw = [0u8; REGION_RECORD_HEADER_SIZE];
            file.read_exact(&mut raw)
                .wrap_err("failed to read region record header")?;
            let header = RegionRecordHeader::read_from_bytes(&raw)
                .map_err(|err| eyre!("invalid region record header: {:?}", err))?;

            let id = header.id.get();
            let size = header.size.get();

            if size == 0 {
                eyre::bail!(StoreError::NotFound {
                    what: "region",
                    id,
                    detail: format!("record at offset {} has zero size", offset),
                });
            }
            let expected = regions.len() as u32;
            if id != expected {
                eyre::bail!(StoreError::NotFound {
                    what: "region",
                    id,
                    detail: format!("expected id {} at offset {}", expected, offset),
                });
            }

            let end = offset + (REGION_RECORD_HEADER_SIZE as u64) + size as u64;
            if end > file_len {
                warn!(region = id, offset, "dropping truncated final region record");
                break;
            }
            ensure!(
                offset <= u32::MAX as u64,
                "region file offset {} exceeds the 32-bit record addressing",
                offset
            );

            regions.push(Region {
                id,
                legacy_address: header.legacy_address.get(),
                size,
                content: None,
                file_offset: offset as u32,
                persisted: true,
            });
            offset = end;
        }

        Ok(regions)
    }

    pub fn mode(&self) -> StoreMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    /// Number of regions with resident content.
    pub fn resident(&self) -> usize {
        self.recency.len()
    }

    pub fn arena(&self) -> &PooledArena {
        &self.arena
    }

    /// Deduplicating insert. Write mode only.
    ///
    /// Returns the id of an existing region with byte-identical content if
    /// one exists (touching it in the recency cache), otherwise reserves a
    /// record offset, copies the content into the arena, indexes the
    /// checksum, and admits the new region to the cache.
    pub fn create(&mut self, legacy_address: u32, data: &[u8]) -> Result<u32> {
        self.ensure_write("create")?;
        ensure!(
            !data.is_empty(),
            StoreError::InvalidArguments {
                reason: "region content cannot be empty".into(),
            }
        );
        ensure!(
            data.len() <= u32::MAX as usize,
            "region content of {} bytes exceeds the 32-bit record format",
            data.len()
        );

        let cs = content_checksum(data);
        if let Some(existing) = self.lookup(cs, data)? {
            self.touch(existing)?;
            debug!(region = existing, bytes = data.len(), "deduplicated region content");
            return Ok(existing);
        }

        let id = self.regions.len() as u32;
        let size = data.len() as u32;
        let handle = self.arena.allocate_copy(data)?;
        let file_offset = self.write_cursor;
        self.write_cursor = file_offset
            .checked_add(REGION_RECORD_HEADER_SIZE as u32 + size)
            .ok_or_else(|| eyre!("region file would exceed 32-bit record addressing"))?;
        self.regions.push(Region {
            id,
            legacy_address,
            size,
            content: Some(handle),
            file_offset,
            persisted: false,
        });
        self.index(cs, id, data)?;
        self.touch(id)?;

        debug!(region = id, bytes = size, checksum = cs, "created region");
        Ok(id)
    }

    /// Directory lookup by id. Fails with full diagnostics when the id is
    /// out of range or the entry at that position carries a different id.
    pub fn region(&self, id: u32) -> Result<&Region> {
        self.check_id(id)?;
        Ok(&self.regions[id as usize])
    }

    /// Content lookup by byte-identity. Write mode only — the checksum
    /// index is never built when opening read-only.
    pub fn find_by_content(&mut self, data: &[u8]) -> Result<Option<u32>> {
        if self.mode == StoreMode::ReadOnly {
            eyre::bail!(StoreError::UnsupportedInReadOnly {
                operation: "content lookup",
            });
        }
        let cs = content_checksum(data);
        match self.lookup(cs, data)? {
            Some(id) => {
                self.touch(id)?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Full content of a region, loading it through the recency cache on a
    /// miss and marking it most recently used.
    pub fn content(&mut self, id: u32) -> Result<&[u8]> {
        self.check_id(id)?;
        self.touch(id)?;
        let region = &self.regions[id as usize];
        let handle = region
            .content
            .ok_or_else(|| eyre!("region {} not resident after cache admission", id))?;
        Ok(self.arena.bytes(handle))
    }

    /// Byte-exact comparison of two regions, resolving either side through
    /// a scratch copy if its content is evicted.
    pub fn regions_equal(&mut self, a: u32, b: u32) -> Result<bool> {
        self.check_id(a)?;
        self.check_id(b)?;
        if a == b {
            return Ok(true);
        }
        if self.regions[a as usize].size != self.regions[b as usize].size {
            return Ok(false);
        }
        let copy = self.content_copy(a)?;
        self.equal_content(b, &copy)
    }

    /// Shrink or grow the resident bound. Shrinking below the current
    /// population evicts the least-recently-used overflow immediately,
    /// flushing any unpersisted entries first.
    pub fn set_cache_capacity(&mut self, capacity: usize) -> Result<()> {
        ensure!(capacity >= 1, "cache capacity must be at least 1");
        self.cache_capacity = capacity;
        while self.recency.len() > self.cache_capacity {
            self.evict_lru()?;
        }
        Ok(())
    }

    /// Evict everything, flushing unpersisted regions to the file.
    pub fn flush_cache(&mut self) -> Result<()> {
        while !self.recency.is_empty() {
            self.evict_lru()?;
        }
        Ok(())
    }

    /// Flush the cache and sync the backing file. Idempotent; also run by
    /// `Drop` as a last resort.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_cache()?;
        if self.mode == StoreMode::ReadWrite {
            self.file
                .sync_all()
                .wrap_err("failed to sync region file at close")?;
        }
        self.closed = true;
        Ok(())
    }

    pub fn stats(&self) -> RegionStoreStats {
        let resident_bytes = self
            .recency
            .iter()
            .map(|&id| self.regions[id as usize].size as u64)
            .sum();
        RegionStoreStats {
            regions: self.regions.len(),
            resident: self.recency.len(),
            cache_capacity: self.cache_capacity,
            resident_bytes,
            total_bytes: self.regions.iter().map(|r| r.size as u64).sum(),
        }
    }

    fn ensure_write(&self, operation: &'static str) -> Result<()> {
        if self.mode == StoreMode::ReadOnly {
            eyre::bail!(StoreError::UnsupportedInReadOnly { operation });
        }
        Ok(())
    }

    fn check_id(&self, id: u32) -> Result<()> {
        let idx = id as usize;
        if idx >= self.regions.len() {
            eyre::bail!(StoreError::NotFound {
                what: "region",
                id,
                detail: format!("directory holds {} regions", self.regions.len()),
            });
        }
        let found = self.regions[idx].id;
        if found != id {
            eyre::bail!(StoreError::NotFound {
                what: "region",
                id,
                detail: format!("directory position {} carries id {}", idx, found),
            });
        }
        Ok(())
    }

    /// Candidates with this checksum, byte-compared against `data`.
    /// Evicted candidates are compared against a scratch file read so the
    /// resident bound is never exceeded by a probe.
    fn lookup(&mut self, cs: u32, data: &[u8]) -> Result<Option<u32>> {
        let candidates: Bucket = match self.checksum_index.get(&cs) {
            Some(bucket) => bucket.clone(),
            None => return Ok(None),
        };
        for candidate in candidates {
            if self.equal_content(candidate, data)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Enter a freshly created region into the checksum index. Finding an
    /// equal-content candidate here means the dedup lookup just missed a
    /// region it should have found — an index bug, reported as the hard
    /// [`StoreError::DuplicateContent`] invariant violation.
    fn index(&mut self, cs: u32, id: u32, data: &[u8]) -> Result<()> {
        let candidates: Bucket = self.checksum_index.get(&cs).cloned().unwrap_or_default();
        for candidate in candidates {
            if self.equal_content(candidate, data)? {
                eyre::bail!(StoreError::DuplicateContent { id, other: candidate });
            }
        }
        self.checksum_index.entry(cs).or_default().push(id);
        Ok(())
    }

    fn equal_content(&mut self, id: u32, data: &[u8]) -> Result<bool> {
        let (size, handle, file_offset) = {
            let region = &self.regions[id as usize];
            (region.size, region.content, region.file_offset)
        };
        if size as usize != data.len() {
            return Ok(false);
        }
        match handle {
            Some(handle) => Ok(self.arena.bytes(handle) == data),
            None => {
                let copy = self.read_payload(file_offset, size)?;
                Ok(copy.as_slice() == data)
            }
        }
    }

    /// Scratch copy of a region's content without touching the cache.
    fn content_copy(&mut self, id: u32) -> Result<Vec<u8>> {
        let (size, handle, file_offset) = {
            let region = &self.regions[id as usize];
            (region.size, region.content, region.file_offset)
        };
        match handle {
            Some(handle) => Ok(self.arena.bytes(handle).to_vec()),
            None => self.read_payload(file_offset, size),
        }
    }

    /// Mark a region most recently used, making it resident first if
    /// necessary. Eviction runs before the load so the resident count
    /// never exceeds the bound, even transiently.
    fn touch(&mut self, id: u32) -> Result<()> {
        if let Some(pos) = self.recency.iter().position(|&entry| entry == id) {
            if pos != 0 {
                let entry = self.recency.remove(pos);
                self.recency.insert(0, entry);
            }
            return Ok(());
        }

        while self.recency.len() >= self.cache_capacity {
            self.evict_lru()?;
        }
        if !self.regions[id as usize].is_resident() {
            self.load_region(id)?;
        }
        self.recency.insert(0, id);
        Ok(())
    }

    fn evict_lru(&mut self) -> Result<()> {
        let victim = match self.recency.pop() {
            Some(victim) => victim,
            None => return Ok(()),
        };
        if !self.regions[victim as usize].persisted {
            self.store_region(victim)?;
        }
        self.unload_region(victim);
        debug!(region = victim, "evicted region content");
        Ok(())
    }

    /// Write a region's record at its reserved offset. Only dirty regions
    /// in write mode ever reach this; read-only regions are persisted by
    /// construction.
    fn store_region(&mut self, id: u32) -> Result<()> {
        self.ensure_write("record write")?;
        let (header, file_offset, handle) = {
            let region = &self.regions[id as usize];
            let handle = region.content.ok_or_else(|| {
                eyre!("region {} is not resident and cannot be written", region.id)
            })?;
            (
                RegionRecordHeader::new(region.id, region.legacy_address, region.size),
                region.file_offset,
                handle,
            )
        };

        self.file
            .seek(SeekFrom::Start(file_offset as u64))
            .wrap_err_with(|| format!("failed to seek record offset of region {}", id))?;
        self.file
            .write_all(header.as_bytes())
            .wrap_err_with(|| format!("failed to write header of region {}", id))?;
        self.file
            .write_all(self.arena.bytes(handle))
            .wrap_err_with(|| format!("failed to write content of region {}", id))?;
        self.file
            .flush()
            .wrap_err_with(|| format!("failed to flush region {}", id))?;

        self.regions[id as usize].persisted = true;
        debug!(region = id, offset = file_offset, "wrote region record");
        Ok(())
    }

    fn load_region(&mut self, id: u32) -> Result<()> {
        let (size, file_offset, resident) = {
            let region = &self.regions[id as usize];
            (region.size, region.file_offset, region.is_resident())
        };
        ensure!(!resident, "region {} is already resident", id);
        debug_assert!(
            self.regions[id as usize].persisted,
            "an evicted region must have been persisted"
        );

        let handle = self.arena.allocate(size as usize)?;
        let payload_start = file_offset as u64 + REGION_RECORD_HEADER_SIZE as u64;
        if let Err(err) = self.file.seek(SeekFrom::Start(payload_start)) {
            self.arena.free(handle);
            return Err(err).wrap_err_with(|| format!("failed to seek content of region {}", id));
        }
        if let Err(err) = self.file.read_exact(self.arena.bytes_mut(handle)) {
            self.arena.free(handle);
            return Err(err).wrap_err_with(|| format!("failed to load content of region {}", id));
        }

        self.regions[id as usize].content = Some(handle);
        Ok(())
    }

    fn unload_region(&mut self, id: u32) {
        if let Some(handle) = self.regions[id as usize].content.take() {
            self.arena.free(handle);
        }
    }

    fn read_payload(&mut self, file_offset: u32, size: u32) -> Result<Vec<u8>> {
        let payload_start = file_offset as u64 + REGION_RECORD_HEADER_SIZE as u64;
        self.file
            .seek(SeekFrom::Start(payload_start))
            .wrap_err("failed to seek region payload")?;
        let mut copy = vec![0u8; size as usize];
        self.file
            .read_exact(&mut copy)
            .wrap_err("failed to read region payload")?;
        Ok(copy)
    }
}

impl Drop for RegionStore {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close() {
            tracing::error!(error = %err, "region store dropped with unflushed state");
        }
    }
}
