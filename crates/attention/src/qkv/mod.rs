//! QKV bias-transpose kernels.
//!
//! Every entry point produces per-head tensors laid out
//! `[batch, heads, seq_len, size_per_head]`; keys and values carry
//! `kv_head_num` heads.

pub mod fused;
pub mod transpose;

use candle_core::Tensor;

pub use fused::add_fused_qkv_bias_transpose;
pub use transpose::{
    add_qkv_bias_ia3_rebuild_padding, add_qkv_bias_ia3_transpose,
    transpose_attention_out_remove_padding, transpose_qkv, Ia3Weights, QkvBias,
};

/// Per-head query, key and value tensors.
#[derive(Debug, Clone)]
pub struct QkvHeads {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
}
