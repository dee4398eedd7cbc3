//! Fused `[Q | K | V]` projection buffer over packed tokens.

use candle_core::Tensor;

use super::transpose::{add_bias, quantize_output, to_heads};
use super::QkvHeads;
use crate::core::errors::{shape_err, Result};
use crate::core::launch::{build_table, LaunchCache, LaunchConfig, LaunchKey};
use crate::core::{Config, HeadGeometry, OutputQuantization, PrecisionPolicy};
use crate::interop::RopeAdapter;
use crate::layout::padding::restore_padding_with;
use crate::layout::BatchDescriptor;

pub(crate) const FLAG_BIAS: u32 = 1;
pub(crate) const FLAG_ROTARY: u32 = 1 << 1;
pub(crate) const FLAG_POSITION_OFFSETS: u32 = 1 << 2;
pub(crate) const FLAG_INT8_OUTPUT: u32 = 1 << 3;

/// Bias-added heads in the compute dtype, padded to `[batch, heads, seq, dim]`.
pub(crate) struct PreparedHeads {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub policy: PrecisionPolicy,
}

/// Add `bias` to the packed buffer, scatter it into the padded grid and split
/// the three sections into heads. Consumes `qkv`.
pub(crate) fn prepare_heads(
    qkv: Tensor,
    bias: Option<&Tensor>,
    batch: &BatchDescriptor,
    geometry: &HeadGeometry,
    launch: &LaunchConfig,
) -> Result<PreparedHeads> {
    let (tokens, width) = qkv.dims2()?;
    if tokens != batch.token_num() || width != geometry.qkv_hidden() {
        return Err(shape_err(format!(
            "fused qkv must be [{}, {}], got {:?}",
            batch.token_num(),
            geometry.qkv_hidden(),
            qkv.dims()
        )));
    }
    if let Some(bias) = bias {
        if bias.dims() != [width] {
            return Err(shape_err(format!(
                "fused bias must be [{width}], got {:?}",
                bias.dims()
            )));
        }
    }

    let policy = PrecisionPolicy::of(&qkv)?;
    let biased = add_bias(&policy.cast_for_compute(&qkv)?, bias)?;
    drop(qkv);
    let padded = restore_padding_with(&biased, batch, launch)?;

    let (q_hidden, kv_hidden) = (geometry.q_hidden(), geometry.kv_hidden());
    let dim = geometry.size_per_head;
    Ok(PreparedHeads {
        q: to_heads(&padded.narrow(2, 0, q_hidden)?, geometry.head_num, dim)?,
        k: to_heads(&padded.narrow(2, q_hidden, kv_hidden)?, geometry.kv_head_num, dim)?,
        v: to_heads(
            &padded.narrow(2, q_hidden + kv_hidden, kv_hidden)?,
            geometry.kv_head_num,
            dim,
        )?,
        policy,
    })
}

/// Rotary position of every padded slot, row-major `[batch, seq_len]`.
///
/// Positions continue after each sequence's cached prefix. Speculative
/// decoding supplies `position_offsets` (one per padded slot), which replace
/// the sequential step within the sequence.
pub(crate) fn token_positions(
    batch: &BatchDescriptor,
    position_offsets: Option<&[u32]>,
    launch: &LaunchConfig,
) -> Result<Vec<u32>> {
    let slots = batch.batch_size() * batch.seq_len();
    let Some(offsets) = position_offsets else {
        return Ok(batch.padded_positions());
    };
    if offsets.len() != slots {
        return Err(shape_err(format!(
            "expected {slots} position offsets, got {}",
            offsets.len()
        )));
    }
    let seq_len = batch.seq_len();
    Ok(build_table(launch, slots, |slot| {
        batch.past_len(slot / seq_len) as u32 + offsets[slot]
    }))
}

/// Fused/packed bias transpose.
///
/// `qkv` is the `[token_num, q_hidden + 2 * kv_hidden]` projection output and
/// is consumed. Adds `bias`, rotates Q and K when the position scheme is
/// rotary, and returns padded `[batch, heads, seq_len, size_per_head]`
/// tensors (K/V use `kv_head_num` heads). With int8 output quantization the
/// returned tensors hold `u8` codes.
pub fn add_fused_qkv_bias_transpose(
    qkv: Tensor,
    bias: Option<&Tensor>,
    batch: &BatchDescriptor,
    config: &Config,
    position_offsets: Option<&[u32]>,
    launch: &mut LaunchCache,
) -> Result<QkvHeads> {
    let rope = RopeAdapter::from_config(config, qkv.device())?;
    let mut flags = 0;
    if bias.is_some() {
        flags |= FLAG_BIAS;
    }
    if rope.is_some() {
        flags |= FLAG_ROTARY;
    }
    if position_offsets.is_some() {
        flags |= FLAG_POSITION_OFFSETS;
    }
    if matches!(config.output_quantization, OutputQuantization::Int8 { .. }) {
        flags |= FLAG_INT8_OUTPUT;
    }
    let slots = batch.batch_size() * batch.seq_len();
    let launch = launch.get_or_compute(
        LaunchKey::new(
            "add_fused_qkv_bias_transpose",
            &[batch.batch_size(), batch.seq_len(), config.geometry.qkv_hidden()],
            flags,
        ),
        slots,
        1,
    );

    let PreparedHeads {
        mut q,
        mut k,
        v,
        policy,
    } = prepare_heads(qkv, bias, batch, &config.geometry, &launch)?;

    if let Some(rope) = rope {
        let positions = token_positions(batch, position_offsets, &launch)?;
        q = rope.rotate(&q, &positions, batch.kv_seq_lens())?;
        k = rope.rotate(&k, &positions, batch.kv_seq_lens())?;
    }

    let finish = |x: &Tensor| -> Result<Tensor> {
        match config.output_quantization {
            OutputQuantization::None => Ok(policy.cast_to_storage(x)?),
            quantization => quantize_output(x, quantization),
        }
    };
    Ok(QkvHeads {
        q: finish(&q)?,
        k: finish(&k)?,
        v: finish(&v)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use positional::PositionEmbeddingType;

    fn config() -> Config {
        Config::new(HeadGeometry::new(2, 1, 2))
    }

    #[test]
    fn splits_sections_and_pads() -> Result<()> {
        let device = Device::Cpu;
        let batch = BatchDescriptor::new(&[2, 1], 2)?;
        let qkv = Tensor::arange(0f32, 24.0, &device)?.reshape((3, 8))?;
        let mut launch = LaunchCache::new();
        let heads = add_fused_qkv_bias_transpose(qkv, None, &batch, &config(), None, &mut launch)?;
        assert_eq!(heads.q.dims(), &[2, 2, 2, 2]);
        assert_eq!(heads.k.dims(), &[2, 1, 2, 2]);
        // token 2 is sequence 1, position 0
        assert_eq!(heads.q.get(1)?.get(1)?.get(0)?.to_vec1::<f32>()?, vec![18.0, 19.0]);
        assert_eq!(heads.k.get(1)?.get(0)?.get(0)?.to_vec1::<f32>()?, vec![20.0, 21.0]);
        assert_eq!(heads.v.get(0)?.get(0)?.get(1)?.to_vec1::<f32>()?, vec![14.0, 15.0]);
        assert_eq!(heads.v.get(1)?.get(0)?.get(1)?.to_vec1::<f32>()?, vec![0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn launch_shape_is_memoized() -> Result<()> {
        let device = Device::Cpu;
        let batch = BatchDescriptor::new(&[1], 1)?;
        let mut launch = LaunchCache::new();
        for _ in 0..3 {
            let qkv = Tensor::zeros((1, 8), DType::F32, &device)?;
            add_fused_qkv_bias_transpose(qkv, None, &batch, &config(), None, &mut launch)?;
        }
        assert_eq!(launch.len(), 1);
        assert_eq!(launch.counters(), (2, 1));
        Ok(())
    }

    #[test]
    fn speculative_offsets_replace_sequential_positions() -> Result<()> {
        let batch = BatchDescriptor::with_kv_seq_lens(&[2, 1], &[6, 3], 2)?;
        let launch = LaunchConfig::for_items(4, 1);
        assert_eq!(token_positions(&batch, None, &launch)?, vec![4, 5, 2, 3]);
        assert_eq!(
            token_positions(&batch, Some(&[0, 0, 1, 0]), &launch)?,
            vec![4, 4, 3, 2]
        );
        assert!(token_positions(&batch, Some(&[0, 0]), &launch).is_err());
        Ok(())
    }

    #[test]
    fn int8_output_emits_offset_codes() -> Result<()> {
        let device = Device::Cpu;
        let mut config = config();
        config.output_quantization = OutputQuantization::Int8 { scale: 2.0 };
        let batch = BatchDescriptor::new(&[1], 2)?;
        let mut row: Vec<f32> = (0..8).map(|v| v as f32).collect();
        row[7] = 100.0;
        let qkv = Tensor::from_vec(row, (1, 8), &device)?;
        let heads = add_fused_qkv_bias_transpose(qkv, None, &batch, &config, None, &mut LaunchCache::new())?;
        assert_eq!(heads.q.dtype(), DType::U8);
        assert_eq!(heads.k.dtype(), DType::U8);
        assert_eq!(heads.v.dtype(), DType::U8);

        assert_eq!(heads.q.get(0)?.get(0)?.to_vec2::<u8>()?, vec![vec![128, 130], vec![128, 128]]);
        assert_eq!(heads.q.get(0)?.get(1)?.get(0)?.to_vec1::<u8>()?, vec![132, 134]);
        assert_eq!(heads.k.get(0)?.get(0)?.get(0)?.to_vec1::<u8>()?, vec![136, 138]);
        // 200 saturates at 127
        assert_eq!(heads.v.get(0)?.get(0)?.get(0)?.to_vec1::<u8>()?, vec![140, 255]);
        Ok(())
    }

    #[test]
    fn empty_batches_yield_empty_heads() -> Result<()> {
        let device = Device::Cpu;
        let mut config = config();
        config.position_embedding_type = PositionEmbeddingType::RopeGptj;
        config.rotary.rotary_dim = 2;

        let batch = BatchDescriptor::new(&[], 1)?;
        let qkv = Tensor::zeros((0, 8), DType::F32, &device)?;
        let heads = add_fused_qkv_bias_transpose(qkv, None, &batch, &config, None, &mut LaunchCache::new())?;
        assert_eq!(heads.q.dims(), &[0, 2, 1, 2]);
        assert_eq!(heads.v.dims(), &[0, 1, 1, 2]);

        let batch = BatchDescriptor::new(&[0, 0], 0)?;
        let qkv = Tensor::zeros((0, 8), DType::F32, &device)?;
        let heads = add_fused_qkv_bias_transpose(qkv, None, &batch, &config, None, &mut LaunchCache::new())?;
        assert_eq!(heads.k.dims(), &[2, 1, 0, 2]);
        Ok(())
    }

    #[test]
    fn rotary_leaves_values_alone() -> Result<()> {
        let device = Device::Cpu;
        let mut config = config();
        config.position_embedding_type = PositionEmbeddingType::RopeGptj;
        config.rotary.rotary_dim = 2;
        let batch = BatchDescriptor::new(&[2], 2)?;
        let qkv = Tensor::ones((2, 8), DType::F32, &device)?;
        let heads = add_fused_qkv_bias_transpose(qkv, None, &batch, &config, None, &mut LaunchCache::new())?;
        let q = heads.q.get(0)?.get(0)?.to_vec2::<f32>()?;
        assert_eq!(q[0], vec![1.0, 1.0]);
        let (s, c) = (1f32.sin(), 1f32.cos());
        assert!((q[1][0] - (c - s)).abs() < 1e-6);
        assert!((q[1][1] - (s + c)).abs() < 1e-6);
        assert_eq!(heads.v.flatten_all()?.to_vec1::<f32>()?, vec![1.0; 4]);
        Ok(())
    }
}
