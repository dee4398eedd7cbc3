//! Layout-agnostic view of a key/value cache.

use candle_core::Tensor;

use crate::core::errors::Result;

/// Counters describing cache traffic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Token rows written (per sequence, all heads at once).
    pub tokens_written: usize,
    /// Contiguous row runs issued to the pool.
    pub write_runs: usize,
    /// Token rows read back.
    pub rows_read: usize,
}

/// Cache operations shared by every addressing strategy.
///
/// Sequences are indexed `batch * beam_width + beam`. Token tensors are
/// batch-major: `[sequences, kv_head_num, seq_len, size_per_head]`; reads
/// return `[kv_head_num, n, size_per_head]` in the working dtype.
pub trait KeyValueCache {
    /// Append `seq_lens[q]` new tokens to each sequence `q` after the tokens
    /// it already holds.
    fn append(&mut self, seq_lens: &[usize], keys: &Tensor, values: &Tensor) -> Result<()>;

    /// Read the entries stored in `slots` of `sequence`.
    fn read(&self, sequence: usize, slots: &[usize]) -> Result<(Tensor, Tensor)>;

    /// Read every retained entry of `sequence` in logical window order.
    fn read_logical(&self, sequence: usize) -> Result<(Tensor, Tensor)>;

    /// Tokens ever appended to `sequence`.
    fn len(&self, sequence: usize) -> usize;

    fn stats(&self) -> CacheStats;
}
