//! Keep-masks that drop padded keys.
//!
//! Layout and dtype match [`super::causal`].

use candle_core::{Device, Tensor};

use crate::core::errors::{shape_err, Result};

/// Construct padding masks from per-batch valid key lengths.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    q_len: usize,
    k_len: usize,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![0f32; batch * q_len * k_len];
    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        for q in 0..q_len {
            let row_start = (b * q_len + q) * k_len;
            data[row_start..row_start + valid].fill(1.0);
        }
    }
    Ok(Tensor::from_vec(data, (batch, q_len, k_len), device)?)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>], q_len: usize) -> Result<Tensor> {
    if padding.is_empty() {
        return Ok(Tensor::zeros((0, q_len, 0), super::MASK_DTYPE, device)?);
    }

    let k_len = padding[0].len();
    if padding.iter().any(|mask| mask.len() != k_len) {
        return Err(shape_err("all boolean padding masks must share k_len"));
    }

    let batch = padding.len();
    let mut data = Vec::with_capacity(batch * q_len * k_len);
    for mask in padding {
        for _ in 0..q_len {
            data.extend(mask.iter().map(|&is_padding| if is_padding { 0f32 } else { 1f32 }));
        }
    }
    Ok(Tensor::from_vec(data, (batch, q_len, k_len), device)?)
}
