//! Interoperability helpers bridging the kernels with upstream components.

pub mod rope_adapter;

pub use rope_adapter::RopeAdapter;
