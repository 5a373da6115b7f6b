//! # Error Taxonomy
//!
//! All fallible operations in tracebuf return `eyre::Result`. Conditions the
//! caller may want to distinguish are raised as [`StoreError`] values through
//! `eyre::bail!`, so they can be recovered with
//! `err.downcast_ref::<StoreError>()`.
//!
//! Every variant is fatal to the operation that raised it. The one soft
//! condition in the system — a bound buffer reused with the same size but
//! different content — is not an error at all: it is logged as a warning and
//! the store proceeds (see `DescriptorStore::refresh`).

use std::fmt;

/// Failure conditions of the region and descriptor stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An id was out of range, or the directory entry at that position
    /// carried a different id (directory corruption).
    NotFound {
        what: &'static str,
        id: u32,
        detail: String,
    },
    /// A content read or comparison was attempted on a still-deferred
    /// descriptor outside the tolerant loading mode.
    NotBound { id: u32 },
    /// Malformed call, e.g. a descriptor created with neither an address
    /// nor content.
    InvalidArguments { reason: String },
    /// Content-based lookup or mutation attempted on a store opened
    /// read-only, where the checksum index is never built.
    UnsupportedInReadOnly { operation: &'static str },
    /// The pooled arena could not satisfy an allocation. Silently falling
    /// back to the heap would corrupt size accounting, so this is fatal.
    OutOfMemory {
        requested: usize,
        detail: &'static str,
    },
    /// Two regions with identical content and different ids were found to
    /// coexist in the checksum index. This is an internal dedup bug, never
    /// user error.
    DuplicateContent { id: u32, other: u32 },
    /// An operation the store deliberately refuses, e.g. growing the size
    /// of an already-bound buffer.
    Unsupported { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { what, id, detail } => {
                write!(f, "{} {} not found: {}", what, id, detail)
            }
            StoreError::NotBound { id } => {
                write!(f, "descriptor {} is deferred and has no content yet", id)
            }
            StoreError::InvalidArguments { reason } => {
                write!(f, "invalid arguments: {}", reason)
            }
            StoreError::UnsupportedInReadOnly { operation } => {
                write!(f, "{} is not available on a store opened read-only", operation)
            }
            StoreError::OutOfMemory { requested, detail } => {
                write!(f, "pooled arena exhausted: {} bytes requested ({})", requested, detail)
            }
            StoreError::DuplicateContent { id, other } => {
                write!(
                    f,
                    "regions {} and {} hold identical content; the dedup index is corrupt",
                    id, other
                )
            }
            StoreError::Unsupported { reason } => write!(f, "unsupported: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}
