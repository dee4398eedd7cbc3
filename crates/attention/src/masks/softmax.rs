//! Masked, biased, scaled softmax over attention logits.
//!
//! `score[b, h, i, j] = softmax_j(qk[b, h, i, j] * qk_scale + mask[b, i, j]
//! + slope[h] * (j - (i + k_len - q_len)))`, computed in f32 with row-max
//! subtraction.

use candle_core::{DType, Tensor, D};
use positional::alibi_bias;

use crate::bias::alibi_slopes_for;
use crate::core::errors::{shape_err, Result};
use crate::core::precision::cast_tensor;
use crate::core::{Config, PrecisionPolicy};

/// Penalty added where a binary mask holds `0`.
pub const BINARY_MASK_PENALTY: f32 = -10_000.0;

/// Logits are clamped to this floor so rows whose every entry is masked with
/// `-inf` still normalize.
pub const MASKED_LOGIT_FLOOR: f32 = -1e20;

/// Per-batch `[batch, q_len, k_len]` mask shared by every head.
#[derive(Debug, Clone)]
pub enum AttentionMask {
    /// Added to the scaled logits as-is (`0` keeps, large negative drops).
    Additive(Tensor),
    /// `1` keeps, `0` drops; converted to `(1 - m) * BINARY_MASK_PENALTY`.
    Binary(Tensor),
}

impl AttentionMask {
    pub fn tensor(&self) -> &Tensor {
        match self {
            Self::Additive(mask) | Self::Binary(mask) => mask,
        }
    }

    /// f32 additive form.
    fn additive(&self) -> Result<Tensor> {
        match self {
            Self::Additive(mask) => Ok(mask.to_dtype(DType::F32)?),
            Self::Binary(mask) => Ok(mask
                .to_dtype(DType::F32)?
                .affine(-(BINARY_MASK_PENALTY as f64), BINARY_MASK_PENALTY as f64)?),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaskedSoftmaxParams {
    /// Multiplier applied to the raw logits, usually `1 / sqrt(size_per_head)`.
    pub qk_scale: f32,
    pub mask: Option<AttentionMask>,
    /// One ALiBi slope per head.
    pub linear_bias_slopes: Option<Vec<f32>>,
}

impl MaskedSoftmaxParams {
    /// Scaling only: no mask and no ALiBi.
    pub fn new(qk_scale: f32) -> Self {
        Self {
            qk_scale,
            mask: None,
            linear_bias_slopes: None,
        }
    }

    /// `1 / sqrt(size_per_head)` scaling, plus the ALiBi slopes the position
    /// scheme calls for.
    pub fn from_config(config: &Config) -> Self {
        let geometry = &config.geometry;
        Self {
            qk_scale: 1.0 / (geometry.size_per_head as f32).sqrt(),
            mask: None,
            linear_bias_slopes: alibi_slopes_for(
                config.position_embedding_type,
                geometry.head_num,
                geometry.size_per_head,
            ),
        }
    }

    pub fn with_mask(mut self, mask: AttentionMask) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_linear_bias_slopes(mut self, slopes: Vec<f32>) -> Self {
        self.linear_bias_slopes = Some(slopes);
        self
    }
}

/// Softmax `qk` (`[batch, heads, q_len, k_len]`, any float dtype) into
/// probabilities of dtype `out_dtype`.
///
/// The mask is applied first and ALiBi added on top of it.
pub fn masked_softmax(qk: &Tensor, params: &MaskedSoftmaxParams, out_dtype: DType) -> Result<Tensor> {
    let (batch, heads, q_len, k_len) = qk.dims4()?;
    let policy = PrecisionPolicy::for_storage(out_dtype)?;

    let mut logits = qk.to_dtype(policy.reduction())?.affine(params.qk_scale as f64, 0.0)?;
    if let Some(mask) = &params.mask {
        if mask.tensor().dims() != [batch, q_len, k_len] {
            return Err(shape_err(format!(
                "attention mask must be [{batch}, {q_len}, {k_len}], got {:?}",
                mask.tensor().dims()
            )));
        }
        logits = logits.broadcast_add(&mask.additive()?.unsqueeze(1)?)?;
    }
    if let Some(slopes) = &params.linear_bias_slopes {
        if slopes.len() != heads {
            return Err(shape_err(format!(
                "{} ALiBi slopes for {heads} heads",
                slopes.len()
            )));
        }
        let bias = alibi_bias(slopes, q_len, k_len, qk.device())?;
        logits = logits.broadcast_add(&bias.unsqueeze(0)?)?;
    }

    let logits = logits.maximum(MASKED_LOGIT_FLOOR)?;
    let row_max = logits.max_keepdim(D::Minus1)?;
    let exp = logits.broadcast_sub(&row_max)?.exp()?;
    let sum = exp.sum_keepdim(D::Minus1)?;
    let probs = exp.broadcast_div(&sum)?;
    log::trace!(
        "masked_softmax: batch={batch} heads={heads} q={q_len} k={k_len} mask={} alibi={}",
        params.mask.is_some(),
        params.linear_bias_slopes.is_some()
    );
    Ok(cast_tensor(&probs, out_dtype)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn binary_mask_zeroes_dropped_keys() -> Result<()> {
        let device = Device::Cpu;
        let qk = Tensor::new(&[[[[1f32, 2.0, 3.0]]]], &device)?;
        let mask = Tensor::new(&[[[1f32, 0.0, 1.0]]], &device)?;
        let params = MaskedSoftmaxParams::new(1.0).with_mask(AttentionMask::Binary(mask));
        let probs = masked_softmax(&qk, &params, DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let denom = 1f32.exp() + 3f32.exp();
        assert!((probs[0] - 1f32.exp() / denom).abs() < 1e-6);
        assert!(probs[1] < 1e-30);
        assert!((probs[2] - 3f32.exp() / denom).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn fully_masked_row_stays_finite() -> Result<()> {
        let device = Device::Cpu;
        let qk = Tensor::zeros((1, 1, 1, 2), DType::F32, &device)?;
        let mask = Tensor::full(f32::NEG_INFINITY, (1, 1, 2), &device)?;
        let params = MaskedSoftmaxParams::new(1.0).with_mask(AttentionMask::Additive(mask));
        let probs = masked_softmax(&qk, &params, DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(probs, vec![0.5, 0.5]);
        Ok(())
    }

    #[test]
    fn narrow_logits_produce_wider_output() -> Result<()> {
        let device = Device::Cpu;
        let qk = Tensor::new(&[0f32, 1.0], &device)?
            .reshape((1, 1, 1, 2))?
            .to_dtype(DType::F16)?;
        let params = MaskedSoftmaxParams::new(2.0);
        let probs = masked_softmax(&qk, &params, DType::F32)?;
        assert_eq!(probs.dtype(), DType::F32);
        let probs = probs.flatten_all()?.to_vec1::<f32>()?;
        let expected = 1.0 / (1.0 + 2f32.exp());
        assert!((probs[0] - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn alibi_accepts_more_queries_than_keys() -> Result<()> {
        let device = Device::Cpu;
        let qk = Tensor::zeros((1, 1, 3, 2), DType::F32, &device)?;
        let slope = 0.5f32;
        let params = MaskedSoftmaxParams::new(1.0).with_linear_bias_slopes(vec![slope]);
        let probs = masked_softmax(&qk, &params, DType::F32)?.get(0)?.get(0)?.to_vec2::<f32>()?;
        for (i, row) in probs.iter().enumerate() {
            // per-row constants cancel, leaving softmax over `slope * (j - i)`
            let logits = [slope * (0.0 - i as f32), slope * (1.0 - i as f32)];
            let denom = logits[0].exp() + logits[1].exp();
            for j in 0..2 {
                assert!((row[j] - logits[j].exp() / denom).abs() < 1e-6, "row {i} key {j}");
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_wrong_slope_count() -> Result<()> {
        let device = Device::Cpu;
        let qk = Tensor::zeros((1, 2, 1, 1), DType::F32, &device)?;
        let params = MaskedSoftmaxParams {
            qk_scale: 1.0,
            mask: None,
            linear_bias_slopes: Some(vec![0.5]),
        };
        assert!(masked_softmax(&qk, &params, DType::F32).is_err());
        Ok(())
    }
}
