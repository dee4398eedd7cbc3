//! Generation-time fused update: bias, rotary and cache write in one pass
//! over the packed projection buffer.

use candle_core::Tensor;

use super::api::KeyValueCache;
use super::layout::CacheAddressing;
use super::store::{CacheHandle, KvCache};
use crate::core::errors::{shape_err, Result};
use crate::core::launch::{LaunchCache, LaunchKey};
use crate::core::Config;
use crate::interop::RopeAdapter;
use crate::layout::BatchDescriptor;
use crate::qkv::fused::{
    prepare_heads, token_positions, PreparedHeads, FLAG_BIAS, FLAG_POSITION_OFFSETS, FLAG_ROTARY,
};

/// Add bias, rotate and append this step's keys/values to `cache`.
///
/// `qkv` is the packed `[token_num, q_hidden + 2 * kv_hidden]` buffer and is
/// consumed. Sequence `b` of `batch` writes cache sequence `b`, continuing
/// after its `kv_seq_lens[b] - seq_lens[b]` cached tokens; the descriptor is
/// authoritative for that prefix. Tokens past the window wrap into the ring.
///
/// With `position_shift_enabled` keys are cached unrotated and queries are
/// rotated at their in-window position, `min(position, window - 1)`.
/// Otherwise both are rotated at their absolute position.
///
/// Returns Q as `[batch, head_num, seq_len, size_per_head]` in the input
/// dtype.
pub fn apply_bias_rope_update_kv_cache<A: CacheAddressing>(
    qkv: Tensor,
    bias: Option<&Tensor>,
    batch: &BatchDescriptor,
    cache: &mut KvCache<A>,
    config: &Config,
    position_offsets: Option<&[u32]>,
    launch: &mut LaunchCache,
) -> Result<Tensor> {
    if batch.batch_size() > cache.sequences() {
        return Err(shape_err(format!(
            "batch of {} sequences exceeds cache of {}",
            batch.batch_size(),
            cache.sequences()
        )));
    }
    let rope = RopeAdapter::from_config(config, qkv.device())?;
    let shift = cache.position_shift_enabled();

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
    let launch = launch.get_or_compute(
        LaunchKey::new(
            "apply_bias_rope_update_kv_cache",
            &[
                batch.batch_size(),
                batch.seq_len(),
                config.geometry.qkv_hidden(),
                cache.window().capacity(),
            ],
            flags | (shift as u32) << 8 | (cache.cache_type() as u32) << 9,
        ),
        batch.batch_size() * batch.seq_len(),
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
        let context_lens = batch.kv_seq_lens();
        if shift {
            let last = cache.window().capacity() as u32 - 1;
            let clamped: Vec<u32> = positions.iter().map(|&p| p.min(last)).collect();
            q = rope.rotate(&q, &clamped, context_lens)?;
        } else {
            q = rope.rotate(&q, &positions, context_lens)?;
            k = rope.rotate(&k, &positions, context_lens)?;
        }
    }

    for b in 0..batch.batch_size() {
        cache.set_len(b, batch.past_len(b));
    }
    cache.append(batch.seq_lens(), &k, &v)?;
    log::trace!(
        "fused update: batch={} tokens={} shift={} rotary={}",
        batch.batch_size(),
        batch.token_num(),
        shift,
        flags & FLAG_ROTARY != 0
    );

    Ok(policy.cast_to_storage(&q)?)
}

impl CacheHandle {
    /// [`apply_bias_rope_update_kv_cache`] on whichever layout this handle holds.
    pub fn apply_bias_rope_update(
        &mut self,
        qkv: Tensor,
        bias: Option<&Tensor>,
        batch: &BatchDescriptor,
        config: &Config,
        position_offsets: Option<&[u32]>,
        launch: &mut LaunchCache,
    ) -> Result<Tensor> {
        match self {
            Self::Linear(cache) => {
                apply_bias_rope_update_kv_cache(qkv, bias, batch, cache, config, position_offsets, launch)
            }
            Self::Paged(cache) => {
                apply_bias_rope_update_kv_cache(qkv, bias, batch, cache, config, position_offsets, launch)
            }
        }
    }
}
