//! Bounded sliding window with attention sinks.
//!
//! Tokens `[0, sink_token_len)` keep their slots forever. Later tokens cycle
//! through `[sink_token_len, cyclic_kv_cache_len)`, each overwriting the
//! oldest non-sink entry once the window is full. The *logical* view lists
//! the retained tokens sinks first, then the ring in chronological order, so
//! logical position `cyclic_kv_cache_len - 1` is always the newest token.

use candle_core::Tensor;

use super::api::KeyValueCache;
use super::layout::CacheAddressing;
use super::store::KvCache;
use crate::core::errors::{shape_err, Result};
use crate::interop::RopeAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindow {
    capacity: usize,
    sink_token_len: usize,
}

impl SlidingWindow {
    pub fn new(cyclic_kv_cache_len: usize, sink_token_len: usize) -> Result<Self> {
        if sink_token_len >= cyclic_kv_cache_len {
            return Err(shape_err(format!(
                "sink_token_len ({sink_token_len}) must be smaller than cyclic_kv_cache_len ({cyclic_kv_cache_len})"
            )));
        }
        Ok(Self {
            capacity: cyclic_kv_cache_len,
            sink_token_len,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn sink_token_len(&self) -> usize {
        self.sink_token_len
    }

    fn ring_len(&self) -> usize {
        self.capacity - self.sink_token_len
    }

    /// Slot written by the token with absolute index `token`.
    #[inline]
    pub fn slot(&self, token: usize) -> usize {
        if token < self.capacity {
            token
        } else {
            self.sink_token_len + (token - self.sink_token_len) % self.ring_len()
        }
    }

    pub fn is_wrapped(&self, total_tokens: usize) -> bool {
        total_tokens > self.capacity
    }

    /// Absolute indices of the retained tokens in logical order.
    pub fn logical_tokens(&self, total_tokens: usize) -> Vec<usize> {
        if total_tokens <= self.capacity {
            return (0..total_tokens).collect();
        }
        let ring_start = total_tokens - self.ring_len();
        (0..self.sink_token_len)
            .chain(ring_start..total_tokens)
            .collect()
    }

    /// Slots of the retained tokens in logical order.
    pub fn logical_slots(&self, total_tokens: usize) -> Vec<usize> {
        self.logical_tokens(total_tokens)
            .into_iter()
            .map(|token| self.slot(token))
            .collect()
    }

    /// In-window position used to rotate the token written at absolute
    /// index `token` once `total_tokens` have been appended.
    pub fn logical_position(&self, token: usize, total_tokens: usize) -> usize {
        if token < self.sink_token_len || total_tokens <= self.capacity {
            token
        } else {
            self.capacity - (total_tokens - token)
        }
    }
}

/// Keys of every sequence in logical window order, rotated for their
/// in-window positions.
#[derive(Debug, Clone)]
pub struct ShiftedKeys {
    /// `[sequences, kv_head_num, max_len, size_per_head]`, zero past each
    /// sequence's length.
    pub keys: Tensor,
    pub lengths: Vec<usize>,
}

/// Build the shifted key buffer from `cache`.
///
/// With `position_shift_enabled` the cache holds unrotated keys and each key
/// is rotated at its logical position. Otherwise keys were rotated at their
/// absolute position when written and are rotated back by the distance they
/// moved (`absolute - logical`), which is zero until the window wraps.
pub fn shift_k_cache<A: CacheAddressing>(cache: &KvCache<A>, rope: &RopeAdapter) -> Result<ShiftedKeys> {
    let window = cache.window();
    let sequences = cache.sequences();
    let max_len = (0..sequences)
        .map(|q| cache.len(q).min(window.capacity()))
        .max()
        .unwrap_or(0);
    let (kv_heads, dim) = (cache.kv_head_num(), cache.size_per_head());

    let mut shifted = Vec::with_capacity(sequences);
    let mut lengths = Vec::with_capacity(sequences);
    for q in 0..sequences {
        let total = cache.len(q);
        let tokens = window.logical_tokens(total);
        let len = tokens.len();
        lengths.push(len);
        if len == 0 {
            shifted.push(Tensor::zeros((kv_heads, max_len, dim), cache.dtype(), cache.device())?);
            continue;
        }

        let slots: Vec<usize> = tokens.iter().map(|&t| window.slot(t)).collect();
        let (keys, _) = cache.read(q, &slots)?;
        let keys = keys.unsqueeze(0)?;
        let rotated = if cache.position_shift_enabled() {
            let positions: Vec<u32> = tokens
                .iter()
                .map(|&t| window.logical_position(t, total) as u32)
                .collect();
            rope.rotate(&keys, &positions, &[total])?
        } else if window.is_wrapped(total) {
            let deltas: Vec<u32> = tokens
                .iter()
                .map(|&t| (t - window.logical_position(t, total)) as u32)
                .collect();
            rope.rotate_back(&keys, &deltas, &[total])?
        } else {
            keys
        };
        let mut rotated = rotated.squeeze(0)?;
        if len < max_len {
            let pad = Tensor::zeros((kv_heads, max_len - len, dim), rotated.dtype(), rotated.device())?;
            rotated = Tensor::cat(&[&rotated, &pad], 1)?;
        }
        shifted.push(rotated);
    }

    log::debug!(
        "shift_k_cache: sequences={} window={} sinks={} max_len={}",
        sequences,
        window.capacity(),
        window.sink_token_len(),
        max_len
    );
    let keys = if shifted.is_empty() {
        Tensor::zeros((0, kv_heads, 0, dim), cache.dtype(), cache.device())?
    } else {
        Tensor::stack(&shifted, 0)?
    };
    Ok(ShiftedKeys { keys, lengths })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_wrap_past_the_sinks() -> Result<()> {
        let window = SlidingWindow::new(6, 2)?;
        let slots: Vec<usize> = (0..12).map(|t| window.slot(t)).collect();
        assert_eq!(slots, vec![0, 1, 2, 3, 4, 5, 2, 3, 4, 5, 2, 3]);
        Ok(())
    }

    #[test]
    fn logical_order_ends_with_newest() -> Result<()> {
        let window = SlidingWindow::new(6, 2)?;
        assert_eq!(window.logical_tokens(4), vec![0, 1, 2, 3]);
        assert_eq!(window.logical_tokens(9), vec![0, 1, 5, 6, 7, 8]);
        assert_eq!(window.logical_slots(9), vec![0, 1, 5, 2, 3, 4]);
        assert_eq!(window.logical_position(8, 9), 5);
        assert_eq!(window.logical_position(5, 9), 2);
        assert_eq!(window.logical_position(1, 9), 1);
        Ok(())
    }

    #[test]
    fn zero_sinks_is_a_plain_ring() -> Result<()> {
        let window = SlidingWindow::new(4, 0)?;
        assert_eq!(window.slot(9), 1);
        assert_eq!(window.logical_tokens(10), vec![6, 7, 8, 9]);
        assert_eq!(window.logical_slots(10), vec![2, 3, 0, 1]);
        Ok(())
    }

    #[test]
    fn sinks_must_fit_in_window() {
        assert!(SlidingWindow::new(4, 4).is_err());
    }
}
