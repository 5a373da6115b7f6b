//! # Descriptor Store
//!
//! The public surface of tracebuf: registration of captured buffers during
//! capture, and id-based lookup during replay. The store owns the
//! descriptor directory and exactly one [`RegionStore`]; every content
//! operation funnels through the region layer's dedup and recency cache.
//!
//! ## Capture (Storing mode)
//!
//! ```ignore
//! let mut store = DescriptorStore::builder()
//!     .cache_capacity(16)
//!     .open("trace.desc", "trace.mem", Mode::Storing)?;
//!
//! // Address and content known: bound immediately, deduplicated.
//! let id = store.create(Some(0x8014_2000), Some(vertex_bytes))?;
//!
//! // Address known, content arrives later: deferred until group binding.
//! let arr = store.create(Some(0x8020_0000), None)?;
//! store.set_size(arr, 4096)?;
//! store.bind_group(&[arr], |start, len| read_captured_memory(start, len))?;
//!
//! store.close()?;
//! ```
//!
//! The directory itself is written at close: one fixed 16-byte record per
//! descriptor, so the replay tool can seek straight to record N.
//!
//! ## Replay (Loading mode)
//!
//! Opening in Loading mode scans both directories up front but reads no
//! content; `bytes(id)` pulls content through the region cache on demand.
//!
//! ## Group Binding
//!
//! Vertex-array captures produce several logical buffers over one span of
//! application memory (interleaved attributes, shared arrays). `bind_group`
//! sorts the deferred descriptors by address, merges overlapping or
//! exactly adjacent ranges into contiguous spans, materializes one region
//! per span through the deduplicating create, and binds each member at its
//! own offset inside the span.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use eyre::{ensure, eyre, Result, WrapErr};
use smallvec::SmallVec;
use tracing::{debug, warn};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::descriptor::{Binding, Descriptor};
use crate::config::{DEFAULT_CACHE_CAPACITY, DESCRIPTOR_RECORD_SIZE};
use crate::error::StoreError;
use crate::memory::PooledArena;
use crate::storage::{RegionStore, RegionStoreOptions, StoreMode};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct DescriptorRecord {
    id: U32,
    legacy_address: U32,
    /// 0 on the wire means the descriptor is deferred.
    size: U32,
    /// Must be 0 when `size` is 0.
    region_id: U32,
}

const _: () = assert!(std::mem::size_of::<DescriptorRecord>() == DESCRIPTOR_RECORD_SIZE);

impl DescriptorRecord {
    fn new(id: u32, legacy_address: u32, size: u32, region_id: u32) -> Self {
        Self {
            id: U32::new(id),
            legacy_address: U32::new(legacy_address),
            size: U32::new(size),
            region_id: U32::new(region_id),
        }
    }
}

/// Which end of the toolchain the store serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Capture: descriptors are created and committed, directories are
    /// written at close.
    Storing,
    /// Replay: directories are loaded at open, contents served on demand.
    Loading,
}

/// Configures and opens a [`DescriptorStore`].
pub struct DescriptorStoreBuilder {
    tolerate_deferred: bool,
    cache_capacity: usize,
    pool: Option<(usize, usize, usize)>,
}

impl DescriptorStoreBuilder {
    fn new() -> Self {
        Self {
            tolerate_deferred: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            pool: None,
        }
    }

    /// Accept descriptors that never received content. Off by default:
    /// a deferred descriptor at close (Storing) or in the directory
    /// (Loading) is then a hard error.
    pub fn tolerate_deferred(mut self, tolerate: bool) -> Self {
        self.tolerate_deferred = tolerate;
        self
    }

    /// Bound on regions with resident content.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Back resident contents with a fixed cluster pool instead of the
    /// heap-passthrough default.
    pub fn pooled_arena(
        mut self,
        pool_bytes: usize,
        cluster_bytes: usize,
        max_handles: usize,
    ) -> Self {
        self.pool = Some((pool_bytes, cluster_bytes, max_handles));
        self
    }

    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        self,
        descriptor_path: P,
        region_path: Q,
        mode: Mode,
    ) -> Result<DescriptorStore> {
        let arena = match self.pool {
            Some((pool_bytes, cluster_bytes, max_handles)) => {
                PooledArena::with_pool(pool_bytes, cluster_bytes, max_handles)?
            }
            None => PooledArena::unpooled(),
        };
        let region_mode = match mode {
            Mode::Storing => StoreMode::ReadWrite,
            Mode::Loading => StoreMode::ReadOnly,
        };
        let regions = RegionStore::open_with(
            region_path,
            region_mode,
            RegionStoreOptions {
                cache_capacity: self.cache_capacity,
                arena,
            },
        )?;

        let descriptor_path = descriptor_path.as_ref().to_path_buf();
        let descriptors = match mode {
            Mode::Storing => Vec::new(),
            Mode::Loading => {
                DescriptorStore::load_directory(&descriptor_path, &regions, self.tolerate_deferred)?
            }
        };

        Ok(DescriptorStore {
            descriptors,
            regions,
            mode,
            tolerate_deferred: self.tolerate_deferred,
            descriptor_path,
            closed: false,
        })
    }
}

/// Directory of captured buffer descriptors over one region store.
#[derive(Debug)]
pub struct DescriptorStore {
    descriptors: Vec<Descriptor>,
    regions: RegionStore,
    mode: Mode,
    tolerate_deferred: bool,
    descriptor_path: PathBuf,
    closed: bool,
}

impl DescriptorStore {
    pub fn builder() -> DescriptorStoreBuilder {
        DescriptorStoreBuilder::new()
    }

    /// Open with default options.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        descriptor_path: P,
        region_path: Q,
        mode: Mode,
    ) -> Result<Self> {
        Self::builder().open(descriptor_path, region_path, mode)
    }

    fn load_directory(
        path: &Path,
        regions: &RegionStore,
        tolerate_deferred: bool,
    ) -> Result<Vec<Descriptor>> {
        let mut file = File::open(path)
            .wrap_err_with(|| format!("failed to open descriptor file {:?}", path))?;
        let file_len = file
            .metadata()
            .wrap_err("failed to stat descriptor file")?
            .len();
        if file_len % DESCRIPTOR_RECORD_SIZE as u64 != 0 {
            warn!(
                trailing = file_len % DESCRIPTOR_RECORD_SIZE as u64,
                "descriptor file ends in a partial record; ignoring the tail"
            );
        }

        let count = file_len / DESCRIPTOR_RECORD_SIZE as u64;
        let mut descriptors = Vec::with_capacity(count as usize);
        for position in 0..count {
            let mut raw = [0u8; DESCRIPTOR_RECORD_SIZE];
            file.read_exact(&mut raw)
                .wrap_err_with(|| format!("failed to read descriptor record {}", position))?;
            let record = DescriptorRecord::read_from_bytes(&raw)
                .map_err(|err| eyre!("invalid descriptor record {}: {:?}", position, err))?;

            let id = record.id.get();
            if id != position as u32 {
                eyre::bail!(StoreError::NotFound {
                    what: "descriptor",
                    id,
                    detail: format!("expected id {} at record position {}", position, position),
                });
            }

            let size = record.size.get();
            let binding = if size == 0 {
                if !tolerate_deferred {
                    return Err(eyre!(StoreError::NotBound { id })
                        .wrap_err("descriptor directory contains a deferred record"));
                }
                let region_id = record.region_id.get();
                if region_id != 0 {
                    eyre::bail!(StoreError::NotFound {
                        what: "descriptor",
                        id,
                        detail: format!("deferred record carries region id {}", region_id),
                    });
                }
                let address = record.legacy_address.get();
                Binding::Deferred {
                    address: (address != 0).then_some(address),
                    size: None,
                }
            } else {
                let region_id = record.region_id.get();
                let region = regions.region(region_id)?;
                let legacy_address = record.legacy_address.get();
                // Offsets are not stored; they are recomputed from the
                // address delta for compatibility with the memory file.
                let offset = legacy_address
                    .checked_sub(region.legacy_address())
                    .ok_or_else(|| {
                        eyre!(StoreError::NotFound {
                            what: "descriptor",
                            id,
                            detail: format!(
                                "address {:#x} precedes region {} at {:#x}",
                                legacy_address,
                                region_id,
                                region.legacy_address()
                            ),
                        })
                    })?;
                if offset + size > region.size() {
                    eyre::bail!(StoreError::NotFound {
                        what: "descriptor",
                        id,
                        detail: format!(
                            "range {}+{} exceeds region {} of {} bytes",
                            offset,
                            size,
                            region_id,
                            region.size()
                        ),
                    });
                }
                Binding::Bound {
                    legacy_address,
                    size,
                    region: region_id,
                    offset,
                }
            };

            descriptors.push(Descriptor { id, binding });
        }

        Ok(descriptors)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tolerates_deferred(&self) -> bool {
        self.tolerate_deferred
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Descriptors still waiting for content.
    pub fn deferred_len(&self) -> usize {
        self.descriptors.iter().filter(|d| d.is_deferred()).count()
    }

    pub fn region_store(&self) -> &RegionStore {
        &self.regions
    }

    pub fn region_store_mut(&mut self) -> &mut RegionStore {
        &mut self.regions
    }

    /// Register a captured buffer. Storing mode only.
    ///
    /// - address and content: committed immediately through the region
    ///   dedup and bound at offset 0. When the content dedups against a
    ///   region captured elsewhere, the descriptor's address follows the
    ///   region (regions match on content, never on address).
    /// - address only: deferred; declare a size with [`set_size`] and
    ///   commit through [`bind_group`].
    /// - content only: deferred with the slice's length as the declared
    ///   size; the final bytes are committed later with [`set_content`]
    ///   (a buffer allocated ahead of its first upload).
    ///
    /// [`set_size`]: DescriptorStore::set_size
    /// [`bind_group`]: DescriptorStore::bind_group
    /// [`set_content`]: DescriptorStore::set_content
    pub fn create(&mut self, address: Option<u32>, data: Option<&[u8]>) -> Result<u32> {
        self.ensure_storing("create")?;

        let id = self.descriptors.len() as u32;
        let binding = match (address, data) {
            (None, None) => eyre::bail!(StoreError::InvalidArguments {
                reason: "a descriptor needs an address or content".into(),
            }),
            (Some(addr), Some(bytes)) => {
                ensure!(
                    !bytes.is_empty(),
                    StoreError::InvalidArguments {
                        reason: "descriptor content cannot be empty".into(),
                    }
                );
                let region = self.regions.create(addr, bytes)?;
                let legacy_address = self.regions.region(region)?.legacy_address();
                Binding::Bound {
                    legacy_address,
                    size: bytes.len() as u32,
                    region,
                    offset: 0,
                }
            }
            (Some(addr), None) => Binding::Deferred {
                address: Some(addr),
                size: None,
            },
            (None, Some(bytes)) => {
                ensure!(
                    !bytes.is_empty(),
                    StoreError::InvalidArguments {
                        reason: "descriptor content cannot be empty".into(),
                    }
                );
                Binding::Deferred {
                    address: None,
                    size: Some(bytes.len() as u32),
                }
            }
        };

        self.descriptors.push(Descriptor { id, binding });
        debug!(descriptor = id, deferred = self.descriptors[id as usize].is_deferred(), "created descriptor");
        Ok(id)
    }

    /// Directory lookup with corruption diagnostics.
    pub fn find(&self, id: u32) -> Result<&Descriptor> {
        self.check_id(id)?;
        Ok(&self.descriptors[id as usize])
    }

    /// Declare the size of a deferred descriptor ahead of group binding.
    /// Resizing a bound descriptor is refused: buffer identity assumes a
    /// stable size.
    pub fn set_size(&mut self, id: u32, size: u32) -> Result<()> {
        self.ensure_storing("set_size")?;
        self.check_id(id)?;
        ensure!(
            size > 0,
            StoreError::InvalidArguments {
                reason: format!("descriptor {} cannot be sized to zero bytes", id),
            }
        );

        match &mut self.descriptors[id as usize].binding {
            Binding::Bound { size: bound, .. } => eyre::bail!(StoreError::Unsupported {
                reason: format!(
                    "descriptor {} is bound to {} bytes and cannot be resized to {}",
                    id, bound, size
                ),
            }),
            Binding::Deferred { size: slot, .. } => {
                *slot = Some(size);
                Ok(())
            }
        }
    }

    /// Commit content to a deferred descriptor that has no address (a
    /// buffer allocated with a declared size whose bytes arrived later).
    /// The content may be shorter than the declaration; the descriptor
    /// binds at the actual content length.
    pub fn set_content(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.ensure_storing("set_content")?;
        self.check_id(id)?;
        ensure!(
            !data.is_empty(),
            StoreError::InvalidArguments {
                reason: format!("descriptor {} cannot be committed with empty content", id),
            }
        );

        let declared = match self.descriptors[id as usize].binding {
            Binding::Bound { .. } => eyre::bail!(StoreError::InvalidArguments {
                reason: format!("descriptor {} already has content", id),
            }),
            Binding::Deferred {
                address: Some(_), ..
            } => eyre::bail!(StoreError::InvalidArguments {
                reason: format!(
                    "descriptor {} has a defined address; its content is supplied by group binding",
                    id
                ),
            }),
            Binding::Deferred { address: None, size } => size.ok_or_else(|| {
                eyre!(StoreError::InvalidArguments {
                    reason: format!("descriptor {} has no declared size", id),
                })
            })?,
        };
        ensure!(
            data.len() as u64 <= declared as u64,
            StoreError::InvalidArguments {
                reason: format!(
                    "writing {} bytes into descriptor {} declared as {} bytes",
                    data.len(),
                    id,
                    declared
                ),
            }
        );

        let region = self.regions.create(0, data)?;
        let legacy_address = self.regions.region(region)?.legacy_address();
        self.descriptors[id as usize].binding = Binding::Bound {
            legacy_address,
            size: data.len() as u32,
            region,
            offset: 0,
        };
        Ok(())
    }

    /// Commit a batch of deferred descriptors whose address ranges may
    /// overlap or abut. Every descriptor must be deferred with a known
    /// address and a declared size.
    ///
    /// `read_memory(start, len)` supplies the captured bytes for each
    /// merged span; it must return exactly `len` bytes.
    pub fn bind_group<F>(&mut self, ids: &[u32], mut read_memory: F) -> Result<()>
    where
        F: FnMut(u32, u32) -> Result<Vec<u8>>,
    {
        self.ensure_storing("bind_group")?;

        let mut members: SmallVec<[(u32, u32, u32); 8]> = SmallVec::with_capacity(ids.len());
        for &id in ids {
            self.check_id(id)?;
            match self.descriptors[id as usize].binding {
                Binding::Bound { .. } => eyre::bail!(StoreError::InvalidArguments {
                    reason: format!("descriptor {} already has content", id),
                }),
                Binding::Deferred { address, size } => {
                    let start = match address {
                        Some(start) if start != 0 => start,
                        _ => eyre::bail!(StoreError::InvalidArguments {
                            reason: format!("descriptor {} has no address for group binding", id),
                        }),
                    };
                    let size = match size {
                        Some(size) if size > 0 => size,
                        _ => eyre::bail!(StoreError::InvalidArguments {
                            reason: format!("descriptor {} has no declared size", id),
                        }),
                    };
                    ensure!(
                        start.checked_add(size - 1).is_some(),
                        StoreError::InvalidArguments {
                            reason: format!(
                                "descriptor {} range {:#x}+{} overflows the address space",
                                id, start, size
                            ),
                        }
                    );
                    members.push((id, start, size));
                }
            }
        }

        members.sort_by_key(|&(_, start, _)| start);

        let mut idx = 0;
        while idx < members.len() {
            let (_, span_start, first_size) = members[idx];
            let mut span_last = span_start + first_size - 1;
            let mut end = idx + 1;
            while end < members.len() {
                let (_, start, size) = members[end];
                // Merge overlapping and exactly adjacent ranges into one span.
                if start <= span_last.saturating_add(1) {
                    span_last = span_last.max(start + size - 1);
                    end += 1;
                } else {
                    break;
                }
            }

            let span_len = span_last - span_start + 1;
            let bytes = read_memory(span_start, span_len)?;
            ensure!(
                bytes.len() as u64 == span_len as u64,
                "group reader returned {} bytes for a {}-byte span at {:#x}",
                bytes.len(),
                span_len,
                span_start
            );

            let region = self.regions.create(span_start, &bytes)?;
            // The span may dedup against a region captured at another
            // address; member addresses follow the region so the loader's
            // offset recomputation (address delta) lands back here.
            let region_address = self.regions.region(region)?.legacy_address();
            debug!(
                region,
                start = span_start,
                bytes = span_len,
                members = end - idx,
                "bound descriptor group"
            );

            for &(id, start, size) in &members[idx..end] {
                let offset = start - span_start;
                self.descriptors[id as usize].binding = Binding::Bound {
                    legacy_address: region_address + offset,
                    size,
                    region,
                    offset,
                };
            }
            idx = end;
        }

        Ok(())
    }

    /// Content of a bound descriptor, via the region recency cache.
    ///
    /// A deferred descriptor fails with [`StoreError::NotBound`] — except
    /// in a Loading-mode store that tolerates deferred descriptors, where
    /// the result is `Ok(None)`.
    pub fn bytes(&mut self, id: u32) -> Result<Option<&[u8]>> {
        self.check_id(id)?;
        match self.descriptors[id as usize].binding {
            Binding::Deferred { .. } => {
                if self.mode == Mode::Loading && self.tolerate_deferred {
                    Ok(None)
                } else {
                    eyre::bail!(StoreError::NotBound { id })
                }
            }
            Binding::Bound {
                region,
                offset,
                size,
                ..
            } => {
                let content = self.regions.content(region)?;
                let start = offset as usize;
                let end = start + size as usize;
                let slice = content.get(start..end).ok_or_else(|| {
                    eyre!(
                        "descriptor {} range {}..{} exceeds region {} content",
                        id,
                        start,
                        end,
                        region
                    )
                })?;
                Ok(Some(slice))
            }
        }
    }

    /// Byte-exact comparison against `data`. Size mismatch compares
    /// unequal; a deferred descriptor cannot be compared.
    pub fn equals_bytes(&mut self, id: u32, data: &[u8]) -> Result<bool> {
        self.check_id(id)?;
        let size = match self.descriptors[id as usize].binding {
            Binding::Deferred { .. } => eyre::bail!(StoreError::NotBound { id }),
            Binding::Bound { size, .. } => size,
        };
        if data.len() as u64 != size as u64 {
            return Ok(false);
        }
        let slice = self
            .bytes(id)?
            .ok_or_else(|| eyre!("bound descriptor {} returned no content", id))?;
        Ok(slice == data)
    }

    /// Byte-exact comparison of two bound descriptors.
    pub fn equals(&mut self, a: u32, b: u32) -> Result<bool> {
        self.check_id(a)?;
        self.check_id(b)?;
        let size_of = |binding: Binding, id: u32| -> Result<u32> {
            match binding {
                Binding::Deferred { .. } => eyre::bail!(StoreError::NotBound { id }),
                Binding::Bound { size, .. } => Ok(size),
            }
        };
        let size_a = size_of(self.descriptors[a as usize].binding, a)?;
        let size_b = size_of(self.descriptors[b as usize].binding, b)?;
        if size_a != size_b {
            return Ok(false);
        }
        if a == b {
            return Ok(true);
        }
        // Contents may alias different regions; copy one side so both can
        // move through the bounded cache.
        let copy = self
            .bytes(a)?
            .ok_or_else(|| eyre!("bound descriptor {} returned no content", a))?
            .to_vec();
        self.equals_bytes(b, &copy)
    }

    /// Re-registration of a bound buffer by the capture layer.
    ///
    /// Applications legitimately rewrite a buffer's contents between uses
    /// without changing its size; that case is logged and captured as a
    /// fresh descriptor (returned). Growing the buffer would change its
    /// identity and is refused.
    pub fn refresh(&mut self, id: u32, address: u32, data: &[u8]) -> Result<u32> {
        self.ensure_storing("refresh")?;
        self.check_id(id)?;

        let size = match self.descriptors[id as usize].binding {
            Binding::Deferred { .. } => eyre::bail!(StoreError::NotBound { id }),
            Binding::Bound { size, .. } => size,
        };
        if data.len() as u64 > size as u64 {
            eyre::bail!(StoreError::Unsupported {
                reason: format!(
                    "buffer {} grew from {} to {} bytes between uses",
                    id,
                    size,
                    data.len()
                ),
            });
        }

        if self.equals_bytes(id, data)? {
            return Ok(id);
        }

        warn!(
            descriptor = id,
            bytes = data.len(),
            "buffer content changed between uses; capturing a replacement"
        );
        self.create(Some(address), Some(data))
    }

    /// Write the descriptor directory (Storing) and close the region
    /// store. A still-deferred descriptor fails the close unless the store
    /// tolerates deferred descriptors, in which case it is written as a
    /// zero-size record.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }

        if self.mode == Mode::Storing {
            let mut file = File::create(&self.descriptor_path).wrap_err_with(|| {
                format!("failed to create descriptor file {:?}", self.descriptor_path)
            })?;
            for desc in &self.descriptors {
                let record = match desc.binding {
                    Binding::Bound {
                        legacy_address,
                        size,
                        region,
                        ..
                    } => DescriptorRecord::new(desc.id, legacy_address, size, region),
                    Binding::Deferred { address, .. } => {
                        if !self.tolerate_deferred {
                            return Err(eyre!(StoreError::NotBound { id: desc.id })
                                .wrap_err("descriptor still deferred at close"));
                        }
                        DescriptorRecord::new(desc.id, address.unwrap_or(0), 0, 0)
                    }
                };
                file.write_all(record.as_bytes()).wrap_err_with(|| {
                    format!("failed to write descriptor record {}", desc.id)
                })?;
            }
            file.sync_all().wrap_err("failed to sync descriptor file")?;
            debug!(
                descriptors = self.descriptors.len(),
                deferred = self.deferred_len(),
                "wrote descriptor directory"
            );
        }

        self.regions.close()?;
        self.closed = true;
        Ok(())
    }

    fn ensure_storing(&self, operation: &'static str) -> Result<()> {
        if self.mode == Mode::Loading {
            eyre::bail!(StoreError::UnsupportedInReadOnly { operation });
        }
        Ok(())
    }

    fn check_id(&self, id: u32) -> Result<()> {
        let idx = id as usize;
        if idx >= self.descriptors.len() {
            eyre::bail!(StoreError::NotFound {
                what: "descriptor",
                id,
                detail: format!("directory holds {} descriptors", self.descriptors.len()),
            });
        }
        let found = self.descriptors[idx].id;
        if found != id {
            eyre::bail!(StoreError::NotFound {
                what: "descriptor",
                id,
                detail: format!("directory position {} carries id {}", idx, found),
            });
        }
        Ok(())
    }
}

impl Drop for DescriptorStore {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.close_inner() {
            tracing::error!(error = %err, "descriptor store dropped without a clean close");
        }
    }
}
