//! Attention masks and the masked softmax.
//!
//! Masks produced here are `[batch, q_len, k_len]` keep-masks of dtype
//! [`MASK_DTYPE`]: `1.0` where attention is permitted, `0.0` otherwise.
//! [`masked_softmax`] also accepts additive masks.

pub mod causal;
pub mod padding;
pub mod softmax;

use candle_core::DType;

/// Dtype shared by all masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_batch_causal_mask, build_causal_mask};
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};
pub use softmax::{masked_softmax, AttentionMask, MaskedSoftmaxParams};

#[cfg(test)]
mod tests;
