//! Causal keep-masks.
//!
//! Masks are [`MASK_DTYPE`](super::MASK_DTYPE) tensors shaped
//! `[batch, q_len, k_len]` holding `1.0` where attention is permitted and
//! `0.0` otherwise; wrap them in [`AttentionMask::Binary`](super::AttentionMask).

use candle_core::{Device, Tensor};

use crate::core::errors::Result;
use crate::core::launch::{build_table, LaunchConfig};
use crate::layout::BatchDescriptor;

/// Construct a causal mask for the supplied sequence dimensions.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(device: &Device, batch: usize, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let mut data = vec![0f32; batch * q_len * k_len];
    for b in 0..batch {
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            let visible = (q + offset + 1).min(k_len);
            data[row_start..row_start + visible].fill(1.0);
        }
    }
    Ok(Tensor::from_vec(data, (batch, q_len, k_len), device)?)
}

/// Causal mask for a variable-length batch whose new tokens follow a cached
/// prefix: query `i` of sequence `b` sees keys `[0, past_len(b) + i]`, and
/// keys past `kv_seq_lens[b]` or queries past `seq_lens[b]` are masked.
/// Shaped `[batch, seq_len, max(kv_seq_lens)]`.
pub fn build_batch_causal_mask(device: &Device, batch: &BatchDescriptor) -> Result<Tensor> {
    let q_len = batch.seq_len();
    let k_len = batch.kv_seq_lens().iter().copied().max().unwrap_or(0);
    let items = batch.batch_size() * q_len * k_len;
    let launch = LaunchConfig::for_items(items, k_len.max(1));
    let data = build_table(&launch, items, |index| {
        let b = index / (q_len * k_len);
        let q = index / k_len % q_len;
        let k = index % k_len;
        let keep = q < batch.seq_lens()[b] && k < batch.kv_seq_lens()[b] && k <= batch.past_len(b) + q;
        if keep {
            1f32
        } else {
            0f32
        }
    });
    Ok(Tensor::from_vec(data, (batch.batch_size(), q_len, k_len), device)?)
}
