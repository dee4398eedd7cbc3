//! Moving rows between the padded `[batch, seq_len, hidden]` grid and the
//! packed `[token_num, hidden]` layout.

use candle_core::{Tensor, D};

use super::BatchDescriptor;
use crate::core::errors::{shape_err, Result};
use crate::core::launch::LaunchConfig;

/// Drop padding rows: `[batch, seq_len, hidden]` → `[token_num, hidden]`.
pub fn remove_padding(padded: &Tensor, batch: &BatchDescriptor) -> Result<Tensor> {
    let launch = LaunchConfig::for_items(batch.token_num(), 1);
    remove_padding_with(padded, batch, &launch)
}

pub(crate) fn remove_padding_with(
    padded: &Tensor,
    batch: &BatchDescriptor,
    launch: &LaunchConfig,
) -> Result<Tensor> {
    let (b, s, hidden) = padded.dims3()?;
    if b != batch.batch_size() || s != batch.seq_len() {
        return Err(shape_err(format!(
            "remove_padding: expected [{}, {}, hidden], got {:?}",
            batch.batch_size(),
            batch.seq_len(),
            padded.dims()
        )));
    }
    let indices = batch.padded_indices(launch);
    let indices = Tensor::from_vec(indices, (batch.token_num(),), padded.device())?;
    Ok(padded
        .reshape((b * s, hidden))?
        .index_select(&indices, 0)?)
}

/// Scatter packed rows back into the padded grid; padding rows are zero.
///
/// Accepts any trailing shape: `[token_num, ...]` → `[batch, seq_len, ...]`.
pub fn restore_padding(packed: &Tensor, batch: &BatchDescriptor) -> Result<Tensor> {
    let launch = LaunchConfig::for_items(batch.batch_size() * batch.seq_len(), 1);
    restore_padding_with(packed, batch, &launch)
}

pub(crate) fn restore_padding_with(
    packed: &Tensor,
    batch: &BatchDescriptor,
    launch: &LaunchConfig,
) -> Result<Tensor> {
    let dims = packed.dims();
    if dims.first() != Some(&batch.token_num()) {
        return Err(shape_err(format!(
            "restore_padding: expected {} packed rows, got {:?}",
            batch.token_num(),
            dims
        )));
    }
    let trailing = &dims[1..];
    let padded_rows = batch.batch_size() * batch.seq_len();

    let mut zero_shape = vec![1usize];
    zero_shape.extend_from_slice(trailing);
    let zero = Tensor::zeros(zero_shape, packed.dtype(), packed.device())?;
    let with_sentinel = Tensor::cat(&[packed, &zero], 0)?;

    let indices = batch.gather_indices(launch);
    let indices = Tensor::from_vec(indices, (padded_rows,), packed.device())?;
    let gathered = with_sentinel.index_select(&indices, 0)?;

    let mut shape = vec![batch.batch_size(), batch.seq_len()];
    shape.extend_from_slice(trailing);
    Ok(gathered.reshape(shape)?)
}

/// Split `[rows, heads * size_per_head]` into `[rows, heads, size_per_head]`.
pub(crate) fn split_heads(x: &Tensor, heads: usize, size_per_head: usize) -> Result<Tensor> {
    let hidden = x.dim(D::Minus1)?;
    debug_assert_eq!(hidden, heads * size_per_head);
    let mut shape = x.dims()[..x.rank() - 1].to_vec();
    shape.push(heads);
    shape.push(size_per_head);
    Ok(x.reshape(shape)?)
}
