//! Bias/IA3 transposes for separate Q/K/V projections and the output-side
//! transposes that undo them.

use candle_core::{DType, Tensor};

use super::QkvHeads;
use crate::core::errors::{shape_err, Result};
use crate::core::{HeadGeometry, OutputQuantization, PrecisionPolicy};
use crate::kv_cache::quant::int8_encode;
use crate::layout::padding::{remove_padding, restore_padding, split_heads};
use crate::layout::BatchDescriptor;

/// Per-section biases, each a `[section_hidden]` vector.
#[derive(Debug, Clone)]
pub struct QkvBias {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
}

impl QkvBias {
    /// Split a fused `[q_hidden + 2 * kv_hidden]` bias into its sections.
    pub fn split(fused: &Tensor, geometry: &HeadGeometry) -> Result<Self> {
        let width = fused.dim(0)?;
        if fused.rank() != 1 || width != geometry.qkv_hidden() {
            return Err(shape_err(format!(
                "fused bias must be [{}], got {:?}",
                geometry.qkv_hidden(),
                fused.dims()
            )));
        }
        let (q_hidden, kv_hidden) = (geometry.q_hidden(), geometry.kv_hidden());
        Ok(Self {
            q: fused.narrow(0, 0, q_hidden)?,
            k: fused.narrow(0, q_hidden, kv_hidden)?,
            v: fused.narrow(0, q_hidden + kv_hidden, kv_hidden)?,
        })
    }
}

/// IA3 rescaling tables for keys and values.
///
/// `task_ids[b]` selects a row of the `[tasks, kv_hidden]` weight tables for
/// sequence `b`; `None` leaves that sequence unscaled.
#[derive(Debug, Clone)]
pub struct Ia3Weights {
    pub task_ids: Vec<Option<u32>>,
    pub key_weights: Tensor,
    pub value_weights: Tensor,
}

impl Ia3Weights {
    fn tasks(&self) -> Result<usize> {
        let (tasks, _) = self.key_weights.dims2()?;
        if self.value_weights.dims() != self.key_weights.dims() {
            return Err(shape_err("IA3 key and value tables must share a shape"));
        }
        Ok(tasks)
    }

    /// `[batch, 1, hidden]` multipliers for `table`, with a row of ones
    /// standing in for absent task ids.
    fn multipliers(&self, table: &Tensor) -> Result<Tensor> {
        let tasks = self.tasks()?;
        let (_, hidden) = table.dims2()?;
        let identity = Tensor::ones((1, hidden), DType::F32, table.device())?;
        let table = Tensor::cat(&[&table.to_dtype(DType::F32)?, &identity], 0)?;
        let ids: Vec<u32> = self
            .task_ids
            .iter()
            .map(|id| match id {
                Some(id) => {
                    debug_assert!((*id as usize) < tasks, "IA3 task id {id} >= {tasks}");
                    *id
                }
                None => tasks as u32,
            })
            .collect();
        let batch = ids.len();
        let ids = Tensor::from_vec(ids, (batch,), table.device())?;
        Ok(table.index_select(&ids, 0)?.reshape((batch, 1, hidden))?)
    }

    pub(crate) fn scale_keys(&self, keys: &Tensor) -> Result<Tensor> {
        Ok(keys.broadcast_mul(&self.multipliers(&self.key_weights)?)?)
    }

    pub(crate) fn scale_values(&self, values: &Tensor) -> Result<Tensor> {
        Ok(values.broadcast_mul(&self.multipliers(&self.value_weights)?)?)
    }
}

pub(super) fn add_bias(x: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    match bias {
        Some(bias) => Ok(x.broadcast_add(&bias.to_dtype(x.dtype())?)?),
        None => Ok(x.clone()),
    }
}

/// `[batch, seq, heads * dim]` → `[batch, heads, seq, dim]`.
pub(super) fn to_heads(x: &Tensor, heads: usize, size_per_head: usize) -> Result<Tensor> {
    Ok(split_heads(x, heads, size_per_head)?
        .transpose(1, 2)?
        .contiguous()?)
}

fn finish(
    q: Tensor,
    k: Tensor,
    v: Tensor,
    bias: Option<&QkvBias>,
    ia3: Option<&Ia3Weights>,
    geometry: &HeadGeometry,
    policy: PrecisionPolicy,
) -> Result<QkvHeads> {
    let q = add_bias(&q, bias.map(|b| &b.q))?;
    let mut k = add_bias(&k, bias.map(|b| &b.k))?;
    let mut v = add_bias(&v, bias.map(|b| &b.v))?;
    if let Some(ia3) = ia3 {
        if ia3.task_ids.len() != k.dim(0)? {
            return Err(shape_err(format!(
                "{} IA3 task ids for a batch of {}",
                ia3.task_ids.len(),
                k.dim(0)?
            )));
        }
        k = ia3.scale_keys(&k)?;
        v = ia3.scale_values(&v)?;
    }
    let dim = geometry.size_per_head;
    Ok(QkvHeads {
        q: policy.cast_to_storage(&to_heads(&q, geometry.head_num, dim)?)?,
        k: policy.cast_to_storage(&to_heads(&k, geometry.kv_head_num, dim)?)?,
        v: policy.cast_to_storage(&to_heads(&v, geometry.kv_head_num, dim)?)?,
    })
}

fn check_padded(x: &Tensor, hidden: usize, name: &str) -> Result<(usize, usize)> {
    let (batch, seq, width) = x.dims3()?;
    if width != hidden {
        return Err(shape_err(format!(
            "{name} must be [batch, seq, {hidden}], got {:?}",
            x.dims()
        )));
    }
    Ok((batch, seq))
}

/// Padded variant: `q`/`k`/`v` are `[batch, seq, section_hidden]`. Adds the
/// biases, applies IA3 to keys and values and writes
/// `[batch, heads, seq, size_per_head]`.
pub fn add_qkv_bias_ia3_transpose(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<&QkvBias>,
    ia3: Option<&Ia3Weights>,
    geometry: &HeadGeometry,
) -> Result<QkvHeads> {
    let policy = PrecisionPolicy::of(q)?;
    let q_shape = check_padded(q, geometry.q_hidden(), "q")?;
    if check_padded(k, geometry.kv_hidden(), "k")? != q_shape
        || check_padded(v, geometry.kv_hidden(), "v")? != q_shape
    {
        return Err(shape_err("q, k and v must share batch and sequence dims"));
    }
    finish(
        policy.cast_for_compute(q)?,
        policy.cast_for_compute(k)?,
        policy.cast_for_compute(v)?,
        bias,
        ia3,
        geometry,
        policy,
    )
}

/// Packed variant: `q`/`k`/`v` are `[token_num, section_hidden]`. Rows are
/// scattered back into the padded grid (padding rows stay zero) before the
/// bias/IA3 transpose.
pub fn add_qkv_bias_ia3_rebuild_padding(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: Option<&QkvBias>,
    ia3: Option<&Ia3Weights>,
    batch: &BatchDescriptor,
    geometry: &HeadGeometry,
) -> Result<QkvHeads> {
    let policy = PrecisionPolicy::of(q)?;
    let rebuild = |x: &Tensor, b: Option<&Tensor>| -> Result<Tensor> {
        let x = add_bias(&policy.cast_for_compute(x)?, b)?;
        restore_padding(&x, batch)
    };
    let q = rebuild(q, bias.map(|b| &b.q))?;
    let k = rebuild(k, bias.map(|b| &b.k))?;
    let v = rebuild(v, bias.map(|b| &b.v))?;
    finish(q, k, v, None, ia3, geometry, policy)
}

pub(super) fn quantize_output(x: &Tensor, quantization: OutputQuantization) -> Result<Tensor> {
    match quantization {
        OutputQuantization::None => Ok(x.clone()),
        OutputQuantization::Int8 { scale } => int8_encode(x, scale),
    }
}

/// `[batch, heads, seq, dim]` → `[batch, seq, heads * dim]`, optionally
/// narrowed to int8 codes.
pub fn transpose_qkv(x: &Tensor, quantization: OutputQuantization) -> Result<Tensor> {
    let (batch, heads, seq, dim) = x.dims4()?;
    let merged = x.transpose(1, 2)?.contiguous()?.reshape((batch, seq, heads * dim))?;
    quantize_output(&merged, quantization)
}

/// `[batch, heads, seq, dim]` → `[token_num, heads * dim]`, dropping padded
/// rows, optionally narrowed to int8 codes.
pub fn transpose_attention_out_remove_padding(
    x: &Tensor,
    batch: &BatchDescriptor,
    quantization: OutputQuantization,
) -> Result<Tensor> {
    let merged = transpose_qkv(x, OutputQuantization::None)?;
    let packed = remove_padding(&merged, batch)?;
    quantize_output(&packed, quantization)
}
