//! Key/value cache store.
//!
//! One [`KvCache`] serves every sequence of a session. It is generic over a
//! [`CacheAddressing`] strategy (contiguous or block-table), optionally
//! stores entries as int8/fp8 codes, and maps token indices through a
//! [`SlidingWindow`] so sequences longer than the window overwrite their
//! oldest non-sink entries.

pub mod api;
pub mod layout;
pub mod quant;
pub mod store;
pub mod update;
pub mod window;

pub use api::{CacheStats, KeyValueCache};
pub use layout::{BlockTable, CacheAddressing, LinearAddressing, PagedAddressing};
pub use quant::{KvCacheDataType, KvScales};
pub use store::{CacheHandle, KvCache};
pub use update::apply_bias_rope_update_kv_cache;
pub use window::{shift_k_cache, ShiftedKeys, SlidingWindow};
