use super::*;
use crate::core::errors::Result;
use crate::layout::BatchDescriptor;
use candle_core::{Device, Tensor};

fn idx(b: usize, q: usize, k: usize, q_len: usize, k_len: usize) -> usize {
    (b * q_len + q) * k_len + k
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let q_len = 3;
    let k_len = 5;

    let mask = build_causal_mask(&device, 2, q_len, k_len)?;
    assert_eq!(mask.dims(), &[2, q_len, k_len]);
    let values = mask.flatten_all()?.to_vec1::<f32>()?;

    // Earliest query can only see the prefix (offset = k_len - q_len).
    assert_eq!(values[idx(0, 0, 2, q_len, k_len)], 1.0);
    assert_eq!(values[idx(0, 0, 3, q_len, k_len)], 0.0);
    // Later queries gain access to more keys.
    assert_eq!(values[idx(1, 2, 4, q_len, k_len)], 1.0);
    Ok(())
}

#[test]
fn causal_mask_handles_single_token_cases() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 1, 1, 1)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![1.0]);

    let mask = build_causal_mask(&device, 1, 1, 4)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![1.0; 4]);

    let mask = build_causal_mask(&device, 1, 4, 2)?;
    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 0, 1, 4, 2)], 0.0);
    assert_eq!(values[idx(0, 3, 1, 4, 2)], 1.0);
    Ok(())
}

#[test]
fn batch_causal_mask_follows_cached_prefix() -> Result<()> {
    let device = Device::Cpu;
    let batch = BatchDescriptor::with_kv_seq_lens(&[2, 1], &[4, 2], 2)?;
    let mask = build_batch_causal_mask(&device, &batch)?;
    assert_eq!(mask.dims(), &[2, 2, 4]);
    let rows = mask.to_vec3::<f32>()?;
    assert_eq!(rows[0][0], vec![1.0, 1.0, 1.0, 0.0]);
    assert_eq!(rows[0][1], vec![1.0, 1.0, 1.0, 1.0]);
    assert_eq!(rows[1][0], vec![1.0, 1.0, 0.0, 0.0]);
    // padded query row
    assert_eq!(rows[1][1], vec![0.0; 4]);
    Ok(())
}

#[test]
fn padding_mask_from_lengths_masks_tail() -> Result<()> {
    let device = Device::Cpu;
    let (q_len, k_len) = (3, 5);
    let mask = padding_mask_from_lengths(&device, &[2, 7], q_len, k_len)?;
    assert_eq!(mask.dims(), &[2, q_len, k_len]);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;
    assert_eq!(values[idx(0, 0, 2, q_len, k_len)], 0.0);
    assert_eq!(values[idx(0, 1, 1, q_len, k_len)], 1.0);
    // Length clamped to k_len, so nothing is masked.
    assert_eq!(values[idx(1, 2, 4, q_len, k_len)], 1.0);
    Ok(())
}

#[test]
fn padding_mask_from_booleans_respects_flags() -> Result<()> {
    let device = Device::Cpu;
    let padding = vec![vec![false, true, false], vec![true, true, false]];
    let mask = padding_mask_from_booleans(&device, &padding, 2)?;
    assert_eq!(mask.dims(), &[2, 2, 3]);
    let rows = mask.to_vec3::<f32>()?;
    assert_eq!(rows[0][1], vec![1.0, 0.0, 1.0]);
    assert_eq!(rows[1][0], vec![0.0, 0.0, 1.0]);

    let ragged = vec![vec![false], vec![false, true]];
    assert!(padding_mask_from_booleans(&device, &ragged, 1).is_err());
    Ok(())
}

#[test]
fn composition_of_causal_and_padding_masks_respects_both() -> Result<()> {
    let device = Device::Cpu;
    let causal = build_causal_mask(&device, 1, 3, 5)?;
    let padding = padding_mask_from_lengths(&device, &[3], 3, 5)?;
    let values = causal.mul(&padding)?.flatten_all()?.to_vec1::<f32>()?;

    // Padding masks final keys even where causality would allow them.
    assert_eq!(values[idx(0, 2, 4, 3, 5)], 0.0);
    assert_eq!(values[idx(0, 1, 1, 3, 5)], 1.0);
    Ok(())
}

#[test]
fn softmax_rows_normalize_and_masked_keys_vanish() -> Result<()> {
    let device = Device::Cpu;
    let qk = Tensor::randn(0f32, 3.0, (2, 4, 3, 5), &device)?;
    let mask = build_causal_mask(&device, 2, 3, 5)?;
    let params = MaskedSoftmaxParams {
        qk_scale: 0.5,
        mask: Some(AttentionMask::Binary(mask.clone())),
        linear_bias_slopes: Some(positional::alibi_slopes(4)),
    };
    let probs = masked_softmax(&qk, &params, MASK_DTYPE)?;
    assert_eq!(probs.dims(), qk.dims());

    let sums = probs.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
    for sum in sums {
        assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
    }
    let dropped = probs
        .broadcast_mul(&mask.affine(-1.0, 1.0)?.unsqueeze(1)?)?
        .max_keepdim(3)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    assert!(dropped.iter().all(|&p| p < 1e-6));
    Ok(())
}

#[test]
fn unmasked_softmax_matches_candle_nn() -> Result<()> {
    let device = Device::Cpu;
    let qk = Tensor::randn(0f32, 1.0, (1, 2, 4, 6), &device)?;
    let params = MaskedSoftmaxParams::new(0.125);
    let ours = masked_softmax(&qk, &params, MASK_DTYPE)?;
    let reference = candle_nn::ops::softmax_last_dim(&qk.affine(0.125, 0.0)?)?;
    let diff = ours.sub(&reference)?.abs()?.max_keepdim(3)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(diff.iter().all(|&d| d < 1e-6));
    Ok(())
}

#[test]
fn causal_mask_with_alibi_handles_more_queries_than_keys() -> Result<()> {
    let device = Device::Cpu;
    let qk = Tensor::randn(0f32, 1.0, (1, 2, 4, 2), &device)?;
    let mask = build_causal_mask(&device, 1, 4, 2)?;
    let params = MaskedSoftmaxParams::new(1.0)
        .with_mask(AttentionMask::Binary(mask))
        .with_linear_bias_slopes(vec![0.5, 0.25]);
    let probs = masked_softmax(&qk, &params, MASK_DTYPE)?;
    let sums = probs.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
    assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    Ok(())
}

#[test]
fn alibi_is_added_after_the_mask() -> Result<()> {
    let device = Device::Cpu;
    let qk = Tensor::randn(0f32, 1.0, (1, 2, 2, 3), &device)?;
    let mask = Tensor::randn(0f32, 1.0, (1, 2, 3), &device)?;
    let slopes = vec![0.25f32, 0.0625];
    let params = MaskedSoftmaxParams {
        qk_scale: 1.0,
        mask: Some(AttentionMask::Additive(mask.clone())),
        linear_bias_slopes: Some(slopes.clone()),
    };
    let fused = masked_softmax(&qk, &params, MASK_DTYPE)?;

    let biased = crate::bias::add_alibi_bias(&qk.broadcast_add(&mask.unsqueeze(1)?)?, &slopes)?;
    let reference = candle_nn::ops::softmax_last_dim(&biased)?;
    let diff = fused.sub(&reference)?.abs()?.sum_all()?.to_vec0::<f32>()?;
    assert!(diff < 1e-5);
    Ok(())
}
