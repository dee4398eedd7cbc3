//! Learned relative-position bias.

use candle_core::Tensor;
use positional::RelativeBucketing;

use crate::core::errors::{shape_err, Result};

/// Source of the `[heads, q_len, k_len]` bias added to the logits.
#[derive(Debug, Clone)]
pub enum RelativeAttentionBias {
    /// Precomputed `[heads, q_len, k_len]` bias matching the logits exactly.
    Aligned(Tensor),
    /// Precomputed `[heads, max_seq_len, max_seq_len]` table; the logits read
    /// its top-left `q_len x k_len` corner.
    Table(Tensor),
    /// Learned `[heads, num_buckets]` weights, bucketed on the fly.
    Implicit {
        weights: Tensor,
        bucketing: RelativeBucketing,
    },
}

impl RelativeAttentionBias {
    /// Bias tile for `q_len x k_len` logits.
    pub fn tile(&self, q_len: usize, k_len: usize) -> Result<Tensor> {
        match self {
            Self::Aligned(bias) => {
                let (_, q, k) = bias.dims3()?;
                if (q, k) != (q_len, k_len) {
                    return Err(shape_err(format!(
                        "aligned relative bias is {q}x{k}, logits are {q_len}x{k_len}"
                    )));
                }
                Ok(bias.clone())
            }
            Self::Table(table) => {
                let (_, rows, cols) = table.dims3()?;
                if rows < q_len || cols < k_len {
                    return Err(shape_err(format!(
                        "relative bias table {rows}x{cols} is smaller than {q_len}x{k_len}"
                    )));
                }
                Ok(table.narrow(1, 0, q_len)?.narrow(2, 0, k_len)?)
            }
            Self::Implicit { weights, bucketing } => Ok(bucketing.bias(weights, q_len, k_len)?),
        }
    }
}

/// Add `bias` to `qk` (`[batch, heads, q_len, k_len]`) for every batch entry.
pub fn add_relative_attention_bias(qk: &Tensor, bias: &RelativeAttentionBias) -> Result<Tensor> {
    let (_, heads, q_len, k_len) = qk.dims4()?;
    let tile = bias.tile(q_len, k_len)?;
    if tile.dim(0)? != heads {
        return Err(shape_err(format!(
            "relative bias has {} heads, logits have {heads}",
            tile.dim(0)?
        )));
    }
    let tile = tile.to_dtype(qk.dtype())?.unsqueeze(0)?;
    Ok(qk.broadcast_add(&tile)?)
}
