//! Attention with Linear Biases.
//!
//! Head `h` of `H` receives slope `2^(-8 (h + 1) / H)` when `H` is a power of
//! two. Other head counts take the slopes of the closest smaller power of two
//! and fill the remainder with every other slope of the next power of two.

use candle_core::{DType, Device, Result, Tensor};

/// Per-head ALiBi slopes.
pub fn alibi_slopes(num_heads: usize) -> Vec<f32> {
    if num_heads == 0 {
        return Vec::new();
    }
    let closest = if num_heads.is_power_of_two() {
        num_heads
    } else {
        num_heads.next_power_of_two() / 2
    };
    let base = 2f64.powf(-8.0 / closest as f64);
    let mut slopes: Vec<f32> = (1..=closest)
        .map(|power| base.powi(power as i32) as f32)
        .collect();

    if closest < num_heads {
        let extra_base = 2f64.powf(-4.0 / closest as f64);
        let extra = num_heads - closest;
        slopes.extend(
            (0..extra).map(|idx| extra_base.powi((2 * idx + 1) as i32) as f32),
        );
    }
    slopes
}

/// Slopes divided by `sqrt(size_per_head)`, for models that add the bias to
/// logits that are already scaled by `1 / sqrt(size_per_head)`.
pub fn alibi_slopes_scaled(num_heads: usize, size_per_head: usize) -> Vec<f32> {
    let inv_sqrt = 1.0 / (size_per_head as f64).sqrt();
    alibi_slopes(num_heads)
        .into_iter()
        .map(|slope| (slope as f64 * inv_sqrt) as f32)
        .collect()
}

/// Analytic bias value for one (query, key) pair. The query is aligned to the
/// end of the key range, so `query_pos = q_idx + k_len - q_len`, which goes
/// negative when there are more queries than keys.
#[inline]
pub fn alibi_value(slope: f32, q_idx: usize, k_idx: usize, q_len: usize, k_len: usize) -> f32 {
    let query_pos = q_idx as f32 + k_len as f32 - q_len as f32;
    slope * (k_idx as f32 - query_pos)
}

/// Materialize the ALiBi bias as an f32 tensor shaped `[heads, q_len, k_len]`.
pub fn alibi_bias(slopes: &[f32], q_len: usize, k_len: usize, device: &Device) -> Result<Tensor> {
    let heads = slopes.len();
    let offset = k_len as f64 - q_len as f64;
    let query = Tensor::arange(0u32, q_len as u32, device)?
        .to_dtype(DType::F32)?
        .affine(1.0, offset)?
        .reshape((1, q_len, 1))?;
    let key = Tensor::arange(0u32, k_len as u32, device)?
        .to_dtype(DType::F32)?
        .reshape((1, 1, k_len))?;
    let distance = key.broadcast_sub(&query)?;
    let slopes = Tensor::from_vec(slopes.to_vec(), (heads, 1, 1), device)?;
    distance.broadcast_mul(&slopes)
}
