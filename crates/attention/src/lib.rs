//! Attention input preparation and key/value-cache maintenance.
//!
//! The crate turns the fused output of a QKV projection into per-head query,
//! key and value tensors laid out `[batch, heads, seq_len, size_per_head]`,
//! maintains a long-lived key/value cache across decoding steps and
//! normalizes attention logits:
//!
//! * [`layout`] maps packed tokens of a variable-length batch to the padded
//!   `[batch, seq_len]` grid and back.
//! * [`qkv`] adds biases, applies IA3 and rotary embeddings and transposes
//!   projections into heads (and attention output back out of them).
//! * [`kv_cache`] stores keys/values under contiguous or block-table
//!   addressing, optionally as int8/fp8 codes, inside a sliding window with
//!   attention sinks.
//! * [`bias`] and [`masks`] add ALiBi or learned relative-position biases and
//!   run the masked, scaled softmax.
//!
//! All kernels operate on `candle_core::Tensor`s, so they run on whichever
//! device the caller allocated the buffers on. Storage dtypes are `f32`,
//! `f16` and `bf16`; rotation, quantization scaling and softmax are computed
//! in `f32`. Configuration is validated once up front; per-element
//! preconditions inside the kernels are debug assertions.

pub mod bias;
pub mod core;
pub mod interop;
pub mod kv_cache;
pub mod layout;
pub mod masks;
pub mod qkv;

pub use crate::core::{AttentionError, Config, HeadGeometry, KvCacheConfig, LaunchCache, OutputQuantization, Result};
pub use kv_cache::{apply_bias_rope_update_kv_cache, shift_k_cache, CacheHandle, KeyValueCache, KvCache};
pub use layout::BatchDescriptor;
pub use masks::{masked_softmax, AttentionMask, MaskedSoftmaxParams};
