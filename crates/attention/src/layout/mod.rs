//! Layout compactor: packed ↔ padded token mapping for variable-length
//! batches.

pub mod batch;
pub mod padding;

pub use batch::BatchDescriptor;
pub use padding::{remove_padding, restore_padding};
