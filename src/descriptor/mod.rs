//! # Descriptor Module
//!
//! The public buffer-registration layer: descriptors identify captured
//! buffers by id, and the descriptor store maps them onto deduplicated
//! regions. Capture tools drive [`DescriptorStore`] in `Storing` mode;
//! replay tools open the same pair of files in `Loading` mode and pull
//! contents back by descriptor id.
//!
//! A descriptor may be created before its content or its address is known
//! (a deferred descriptor); the [`Binding`] sum type tracks exactly which
//! half is missing until an explicit commit supplies it.

mod descriptor;
mod store;

pub use descriptor::{Binding, Descriptor};
pub use store::{DescriptorStore, DescriptorStoreBuilder, Mode};
