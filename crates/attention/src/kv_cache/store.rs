//! Cache storage generic over the addressing strategy.
//!
//! Keys and values live in two pools shaped `[rows, kv_head_num,
//! size_per_head]`, allocated once for the lifetime of the session. Writes
//! quantize (when configured), group the target rows into contiguous runs
//! and copy each run in place; reads gather rows and dequantize.

use std::cell::Cell;
use std::ops::Range;

use candle_core::{DType, Device, Tensor};

use super::api::{CacheStats, KeyValueCache};
use super::layout::{BlockTable, CacheAddressing, LinearAddressing, PagedAddressing};
use super::quant::{dequantize, quantize, KvCacheDataType, KvScales};
use super::window::SlidingWindow;
use crate::core::errors::{shape_err, Result};
use crate::core::{Config, PrecisionPolicy};

#[derive(Debug)]
pub struct KvCache<A: CacheAddressing> {
    addressing: A,
    window: SlidingWindow,
    kv_head_num: usize,
    size_per_head: usize,
    dtype: DType,
    cache_type: KvCacheDataType,
    scales: KvScales,
    position_shift_enabled: bool,
    keys: Tensor,
    values: Tensor,
    lengths: Vec<usize>,
    stats: Cell<CacheStats>,
}

impl KvCache<LinearAddressing> {
    /// Contiguous cache for `batch_size * beam_width` sequences of
    /// `max_attention_window_size` slots each.
    pub fn linear(batch_size: usize, config: &Config, dtype: DType, device: &Device) -> Result<Self> {
        let sequences = batch_size * config.cache.beam_width;
        let addressing = LinearAddressing::new(sequences, config.cache.max_attention_window_size);
        Self::new(addressing, config, dtype, device)
    }
}

impl KvCache<PagedAddressing> {
    /// Paged cache over an externally allocated block table.
    pub fn paged(table: BlockTable, config: &Config, dtype: DType, device: &Device) -> Result<Self> {
        if table.tokens_per_block() != config.cache.tokens_per_block {
            return Err(shape_err(format!(
                "block table uses {} tokens per block, config expects {}",
                table.tokens_per_block(),
                config.cache.tokens_per_block
            )));
        }
        Self::new(PagedAddressing::new(table), config, dtype, device)
    }
}

impl<A: CacheAddressing> KvCache<A> {
    pub fn new(addressing: A, config: &Config, dtype: DType, device: &Device) -> Result<Self> {
        PrecisionPolicy::for_storage(dtype)?;
        let cache = &config.cache;
        let window = SlidingWindow::new(cache.max_attention_window_size, cache.sink_token_len)?;
        if addressing.capacity() < window.capacity() {
            return Err(shape_err(format!(
                "cache layout holds {} slots per sequence, window needs {}",
                addressing.capacity(),
                window.capacity()
            )));
        }

        let scales = if cache.cache_type.is_quantized() {
            KvScales::new(config.kv_scale())
        } else {
            KvScales::identity()
        };
        let shape = (
            addressing.pool_rows(),
            config.geometry.kv_head_num,
            config.geometry.size_per_head,
        );
        let storage = cache.cache_type.storage_dtype(dtype);
        let keys = match cache.cache_type {
            KvCacheDataType::Int8 => Tensor::full(128u8, shape, device)?.contiguous()?,
            _ => Tensor::zeros(shape, storage, device)?,
        };
        let values = keys.copy()?;

        log::info!(
            "kv-cache init: sequences={} capacity={} rows={} kv_heads={} head_dim={} cache_type={:?} dtype={:?} sinks={}",
            addressing.sequences(),
            window.capacity(),
            addressing.pool_rows(),
            config.geometry.kv_head_num,
            config.geometry.size_per_head,
            cache.cache_type,
            dtype,
            window.sink_token_len()
        );

        Ok(Self {
            lengths: vec![0; addressing.sequences()],
            addressing,
            window,
            kv_head_num: config.geometry.kv_head_num,
            size_per_head: config.geometry.size_per_head,
            dtype,
            cache_type: cache.cache_type,
            scales,
            position_shift_enabled: cache.position_shift_enabled,
            keys,
            values,
            stats: Cell::new(CacheStats::default()),
        })
    }

    pub fn addressing(&self) -> &A {
        &self.addressing
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    pub fn sequences(&self) -> usize {
        self.addressing.sequences()
    }

    pub fn kv_head_num(&self) -> usize {
        self.kv_head_num
    }

    pub fn size_per_head(&self) -> usize {
        self.size_per_head
    }

    /// Working dtype handed in and returned by reads.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        self.keys.device()
    }

    pub fn cache_type(&self) -> KvCacheDataType {
        self.cache_type
    }

    pub fn scales(&self) -> KvScales {
        self.scales
    }

    pub fn position_shift_enabled(&self) -> bool {
        self.position_shift_enabled
    }

    /// Pool rows for tokens `tokens` of `sequence`, after window mapping.
    pub fn rows_for(&self, sequence: usize, tokens: Range<usize>) -> Vec<usize> {
        tokens
            .map(|token| self.addressing.row(sequence, self.window.slot(token)))
            .collect()
    }

    pub(crate) fn set_len(&mut self, sequence: usize, len: usize) {
        self.lengths[sequence] = len;
    }

    /// Store `keys`/`values` (`[n, kv_head_num, size_per_head]`) into `rows`.
    /// Rows are written in order, so a later duplicate wins.
    pub(crate) fn write_rows(&mut self, rows: &[usize], keys: &Tensor, values: &Tensor) -> Result<()> {
        debug_assert_eq!(keys.dim(0)?, rows.len());
        debug_assert!(rows.iter().all(|&row| row < self.addressing.pool_rows()));
        if rows.is_empty() {
            return Ok(());
        }
        let keys = quantize(keys, self.cache_type, self.scales, self.dtype)?;
        let values = quantize(values, self.cache_type, self.scales, self.dtype)?;

        let mut runs = 0;
        let mut start = 0;
        while start < rows.len() {
            let mut end = start + 1;
            while end < rows.len() && rows[end] == rows[end - 1] + 1 {
                end += 1;
            }
            let len = end - start;
            self.keys
                .slice_set(&keys.narrow(0, start, len)?.contiguous()?, 0, rows[start])?;
            self.values
                .slice_set(&values.narrow(0, start, len)?.contiguous()?, 0, rows[start])?;
            runs += 1;
            start = end;
        }

        let mut stats = self.stats.get();
        stats.tokens_written += rows.len();
        stats.write_runs += runs;
        self.stats.set(stats);
        log::trace!("kv-cache write: rows={} runs={}", rows.len(), runs);
        Ok(())
    }

    /// Bulk prompt initialization: replace the contents of the first
    /// `k_src.dim(0)` sequences with their prompt K/V
    /// (`[batch, kv_head_num, seq_len, size_per_head]`), keeping
    /// `sequence_lengths[b]` tokens of each.
    pub fn transpose_batch_major(
        &mut self,
        k_src: &Tensor,
        v_src: &Tensor,
        sequence_lengths: &[usize],
    ) -> Result<()> {
        let local_batch = k_src.dim(0)?;
        if sequence_lengths.len() != local_batch || local_batch > self.sequences() {
            return Err(shape_err(format!(
                "transpose_batch_major: {} sources, {} lengths, {} cache sequences",
                local_batch,
                sequence_lengths.len(),
                self.sequences()
            )));
        }
        for len in self.lengths.iter_mut().take(local_batch) {
            *len = 0;
        }
        self.append(sequence_lengths, k_src, v_src)
    }

    fn check_tokens(&self, keys: &Tensor, values: &Tensor, batch: usize) -> Result<usize> {
        let (b, heads, seq_len, dim) = keys.dims4()?;
        if b != batch || heads != self.kv_head_num || dim != self.size_per_head {
            return Err(shape_err(format!(
                "cache tokens must be [{batch}, {}, seq_len, {}], got {:?}",
                self.kv_head_num,
                self.size_per_head,
                keys.dims()
            )));
        }
        if values.dims() != keys.dims() {
            return Err(shape_err("values shape must match keys shape"));
        }
        Ok(seq_len)
    }
}

impl<A: CacheAddressing> KeyValueCache for KvCache<A> {
    fn append(&mut self, seq_lens: &[usize], keys: &Tensor, values: &Tensor) -> Result<()> {
        if seq_lens.len() > self.sequences() {
            return Err(shape_err(format!(
                "{} sequences appended to a cache of {}",
                seq_lens.len(),
                self.sequences()
            )));
        }
        let seq_len = self.check_tokens(keys, values, seq_lens.len())?;

        let mut rows = Vec::new();
        let mut key_chunks = Vec::new();
        let mut value_chunks = Vec::new();
        for (q, &n) in seq_lens.iter().enumerate() {
            debug_assert!(n <= seq_len, "sequence {q} appends {n} of {seq_len} tokens");
            if n == 0 {
                continue;
            }
            let start = self.lengths[q];
            rows.extend(self.rows_for(q, start..start + n));
            key_chunks.push(keys.get(q)?.narrow(1, 0, n)?.transpose(0, 1)?);
            value_chunks.push(values.get(q)?.narrow(1, 0, n)?.transpose(0, 1)?);
            self.lengths[q] = start + n;
        }
        if rows.is_empty() {
            return Ok(());
        }
        let keys = Tensor::cat(&key_chunks, 0)?;
        let values = Tensor::cat(&value_chunks, 0)?;
        self.write_rows(&rows, &keys, &values)
    }

    fn read(&self, sequence: usize, slots: &[usize]) -> Result<(Tensor, Tensor)> {
        debug_assert!(slots.iter().all(|&slot| slot < self.window.capacity()));
        let rows: Vec<u32> = slots
            .iter()
            .map(|&slot| self.addressing.row(sequence, slot) as u32)
            .collect();
        let n = rows.len();
        let index = Tensor::from_vec(rows, (n,), self.device())?;
        let keys = self.keys.index_select(&index, 0)?;
        let values = self.values.index_select(&index, 0)?;
        let keys = dequantize(&keys, self.cache_type, self.scales, self.dtype)?;
        let values = dequantize(&values, self.cache_type, self.scales, self.dtype)?;

        let mut stats = self.stats.get();
        stats.rows_read += n;
        self.stats.set(stats);
        Ok((keys.transpose(0, 1)?.contiguous()?, values.transpose(0, 1)?.contiguous()?))
    }

    fn read_logical(&self, sequence: usize) -> Result<(Tensor, Tensor)> {
        let slots = self.window.logical_slots(self.lengths[sequence]);
        self.read(sequence, &slots)
    }

    fn len(&self, sequence: usize) -> usize {
        self.lengths.get(sequence).copied().unwrap_or(0)
    }

    fn stats(&self) -> CacheStats {
        self.stats.get()
    }
}

/// Cache whose layout was chosen from [`KvCacheConfig::enable_paged_kv_fmha`](crate::core::KvCacheConfig).
#[derive(Debug)]
pub enum CacheHandle {
    Linear(KvCache<LinearAddressing>),
    Paged(KvCache<PagedAddressing>),
}

impl CacheHandle {
    /// Allocate the layout selected by `config` for `batch_size` requests.
    /// Paged caches receive a contiguous block table.
    pub fn from_config(batch_size: usize, config: &Config, dtype: DType, device: &Device) -> Result<Self> {
        if config.cache.enable_paged_kv_fmha {
            let table = BlockTable::contiguous(
                batch_size * config.cache.beam_width,
                config.cache.max_attention_window_size,
                config.cache.tokens_per_block,
            )?;
            Ok(Self::Paged(KvCache::paged(table, config, dtype, device)?))
        } else {
            Ok(Self::Linear(KvCache::linear(batch_size, config, dtype, device)?))
        }
    }

    pub fn is_paged(&self) -> bool {
        matches!(self, Self::Paged(_))
    }
}

impl KeyValueCache for CacheHandle {
    fn append(&mut self, seq_lens: &[usize], keys: &Tensor, values: &Tensor) -> Result<()> {
        match self {
            Self::Linear(cache) => cache.append(seq_lens, keys, values),
            Self::Paged(cache) => cache.append(seq_lens, keys, values),
        }
    }

    fn read(&self, sequence: usize, slots: &[usize]) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Linear(cache) => cache.read(sequence, slots),
            Self::Paged(cache) => cache.read(sequence, slots),
        }
    }

    fn read_logical(&self, sequence: usize) -> Result<(Tensor, Tensor)> {
        match self {
            Self::Linear(cache) => cache.read_logical(sequence),
            Self::Paged(cache) => cache.read_logical(sequence),
        }
    }

    fn len(&self, sequence: usize) -> usize {
        match self {
            Self::Linear(cache) => cache.len(sequence),
            Self::Paged(cache) => cache.len(sequence),
        }
    }

    fn stats(&self) -> CacheStats {
        match self {
            Self::Linear(cache) => cache.stats(),
            Self::Paged(cache) => cache.stats(),
        }
    }
}
