//! # Descriptor
//!
//! A lightweight handle onto captured buffer content: the identity a trace
//! call refers to, and its binding onto a region once content and address
//! are both known.

/// Binding state of a descriptor.
///
/// A descriptor starts deferred when its address or content is unknown at
/// creation (a buffer allocated before its first upload, or an upload whose
/// final location is decided later). Binding is one-way: once bound, a
/// descriptor never returns to deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Deferred {
        /// Captured virtual address, when known.
        address: Option<u32>,
        /// Declared byte length, when known.
        size: Option<u32>,
    },
    Bound {
        legacy_address: u32,
        size: u32,
        region: u32,
        /// Byte offset of this buffer inside the region's content.
        offset: u32,
    },
}

/// One entry in the descriptor directory.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub(crate) id: u32,
    pub(crate) binding: Binding,
}

impl Descriptor {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self.binding, Binding::Deferred { .. })
    }

    /// The captured virtual address; 0 while unknown (the on-wire
    /// convention for deferred records).
    pub fn legacy_address(&self) -> u32 {
        match self.binding {
            Binding::Deferred { address, .. } => address.unwrap_or(0),
            Binding::Bound { legacy_address, .. } => legacy_address,
        }
    }

    /// Byte length; 0 while unknown.
    pub fn size(&self) -> u32 {
        match self.binding {
            Binding::Deferred { size, .. } => size.unwrap_or(0),
            Binding::Bound { size, .. } => size,
        }
    }

    /// Offset into the bound region's content; 0 while deferred.
    pub fn offset(&self) -> u32 {
        match self.binding {
            Binding::Deferred { .. } => 0,
            Binding::Bound { offset, .. } => offset,
        }
    }

    pub fn region_id(&self) -> Option<u32> {
        match self.binding {
            Binding::Deferred { .. } => None,
            Binding::Bound { region, .. } => Some(region),
        }
    }

    /// Inclusive end of the buffer's address range. Meaningful only when
    /// both address and size are known.
    pub fn last_address(&self) -> u32 {
        self.legacy_address() + self.size() - 1
    }
}
