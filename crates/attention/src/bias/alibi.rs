//! ALiBi slope selection.

use candle_core::Tensor;
use positional::{alibi_bias, alibi_slopes, alibi_slopes_scaled, PositionEmbeddingType};

use crate::core::errors::{shape_err, Result};

/// Per-head slopes for `position`, or `None` when the scheme has no linear bias.
pub fn alibi_slopes_for(
    position: PositionEmbeddingType,
    head_num: usize,
    size_per_head: usize,
) -> Option<Vec<f32>> {
    match position {
        PositionEmbeddingType::Alibi => Some(alibi_slopes(head_num)),
        PositionEmbeddingType::AlibiWithScale => Some(alibi_slopes_scaled(head_num, size_per_head)),
        _ => None,
    }
}

/// Add `slope[h] * (key_pos - query_pos)` to `qk` (`[batch, heads, q_len, k_len]`).
///
/// [`masked_softmax`](crate::masks::masked_softmax) folds the same bias in
/// directly; this is for callers that post-process logits themselves.
pub fn add_alibi_bias(qk: &Tensor, slopes: &[f32]) -> Result<Tensor> {
    let (_, heads, q_len, k_len) = qk.dims4()?;
    if slopes.len() != heads {
        return Err(shape_err(format!("{} ALiBi slopes for {heads} heads", slopes.len())));
    }
    let bias = alibi_bias(slopes, q_len, k_len, qk.device())?.to_dtype(qk.dtype())?;
    Ok(qk.broadcast_add(&bias.unsqueeze(0)?)?)
}
