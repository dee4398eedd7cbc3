//! Configuration, errors and launch bookkeeping shared by every kernel.
//!
//! Working tensors use the batch-major layout `[batch, heads, seq_len,
//! size_per_head]`; packed buffers are `[token_num, hidden]`. Math runs in
//! `f32` regardless of the storage dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;
pub mod launch;
pub mod precision;

pub use config::{Config, HeadGeometry, KvCacheConfig, OutputQuantization};
pub use errors::{AttentionError, Result};
pub use launch::{build_table, LaunchCache, LaunchConfig, LaunchKey};
pub use precision::PrecisionPolicy;
