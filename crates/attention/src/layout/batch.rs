//! Batch descriptor for variable-length batches.
//!
//! Packed token `i` (`0 <= i < token_num`) lives at padded index
//! `i + padding_offset[i]` of the `[batch, seq_len]` grid.

use candle_core::{Device, Tensor};

use crate::core::errors::{shape_err, Result};
use crate::core::launch::{build_table, LaunchConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDescriptor {
    batch_size: usize,
    seq_len: usize,
    token_num: usize,
    seq_lens: Vec<usize>,
    kv_seq_lens: Vec<usize>,
    cu_seqlens: Vec<u32>,
    padding_offset: Vec<u32>,
    mask_offset: Vec<u32>,
}

impl BatchDescriptor {
    /// Describe a batch whose sequences carry `seq_lens` new tokens each,
    /// padded to `seq_len`. The cached context defaults to the new tokens only.
    pub fn new(seq_lens: &[usize], seq_len: usize) -> Result<Self> {
        Self::with_kv_seq_lens(seq_lens, seq_lens, seq_len)
    }

    /// Describe a batch where sequence `b` has `kv_seq_lens[b]` tokens of
    /// total context, the last `seq_lens[b]` of which are new this step.
    pub fn with_kv_seq_lens(seq_lens: &[usize], kv_seq_lens: &[usize], seq_len: usize) -> Result<Self> {
        if seq_lens.len() != kv_seq_lens.len() {
            return Err(shape_err(format!(
                "seq_lens ({}) and kv_seq_lens ({}) disagree on batch size",
                seq_lens.len(),
                kv_seq_lens.len()
            )));
        }
        if let Some((b, len)) = seq_lens.iter().enumerate().find(|(_, &len)| len > seq_len) {
            return Err(shape_err(format!(
                "sequence {b} has {len} tokens but the padded length is {seq_len}"
            )));
        }
        if let Some(b) = (0..seq_lens.len()).find(|&b| kv_seq_lens[b] < seq_lens[b]) {
            return Err(shape_err(format!(
                "sequence {b}: kv_seq_len {} shorter than seq_len {}",
                kv_seq_lens[b], seq_lens[b]
            )));
        }

        let batch_size = seq_lens.len();
        let mut cu_seqlens = Vec::with_capacity(batch_size + 1);
        cu_seqlens.push(0u32);
        for &len in seq_lens {
            let last = *cu_seqlens.last().unwrap_or(&0);
            cu_seqlens.push(last + len as u32);
        }
        let token_num = cu_seqlens[batch_size] as usize;

        let mut padding_offset = Vec::with_capacity(token_num);
        for (b, &len) in seq_lens.iter().enumerate() {
            let offset = (b * seq_len) as u32 - cu_seqlens[b];
            padding_offset.extend(std::iter::repeat(offset).take(len));
        }
        let mask_offset = padding_offset.clone();

        Ok(Self {
            batch_size,
            seq_len,
            token_num,
            seq_lens: seq_lens.to_vec(),
            kv_seq_lens: kv_seq_lens.to_vec(),
            cu_seqlens,
            padding_offset,
            mask_offset,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Padded per-sequence length.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn token_num(&self) -> usize {
        self.token_num
    }

    pub fn seq_lens(&self) -> &[usize] {
        &self.seq_lens
    }

    pub fn kv_seq_lens(&self) -> &[usize] {
        &self.kv_seq_lens
    }

    /// Tokens already cached for sequence `b` before this step.
    pub fn past_len(&self, b: usize) -> usize {
        self.kv_seq_lens[b] - self.seq_lens[b]
    }

    /// Prefix sums of `seq_lens`, length `batch_size + 1`.
    pub fn cu_seqlens(&self) -> &[u32] {
        &self.cu_seqlens
    }

    pub fn padding_offset(&self) -> &[u32] {
        &self.padding_offset
    }

    /// Offsets used when scattering attention output back out of (or into)
    /// the padded grid.
    pub fn mask_offset(&self) -> &[u32] {
        &self.mask_offset
    }

    /// Padded index of packed token `i`.
    #[inline]
    pub fn padded_index(&self, i: usize) -> usize {
        debug_assert!(i < self.token_num, "packed index {i} >= token_num {}", self.token_num);
        i + self.padding_offset[i] as usize
    }

    /// `(sequence, position within the sequence)` of packed token `i`.
    #[inline]
    pub fn locate(&self, i: usize) -> (usize, usize) {
        let padded = self.padded_index(i);
        (padded / self.seq_len, padded % self.seq_len)
    }

    /// Packed index of `(sequence, position)`, or `None` for padding.
    pub fn packed_index(&self, b: usize, pos: usize) -> Option<usize> {
        (b < self.batch_size && pos < self.seq_lens[b]).then(|| self.cu_seqlens[b] as usize + pos)
    }

    /// Padded index of every packed token, in packed order.
    pub fn padded_indices(&self, launch: &LaunchConfig) -> Vec<u32> {
        build_table(launch, self.token_num, |i| self.padded_index(i) as u32)
    }

    /// For each slot of the padded grid, the packed row it reads from;
    /// padding slots point at `token_num` (one past the last token).
    pub fn gather_indices(&self, launch: &LaunchConfig) -> Vec<u32> {
        let padded = self.batch_size * self.seq_len;
        build_table(launch, padded, |slot| {
            let (b, pos) = (slot / self.seq_len, slot % self.seq_len);
            self.packed_index(b, pos).unwrap_or(self.token_num) as u32
        })
    }

    /// Upload `padding_offset` to `device`.
    pub fn padding_offset_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_vec(
            self.padding_offset.clone(),
            (self.token_num,),
            device,
        )?)
    }

    /// Sequential positions for every padded slot, offset by each sequence's
    /// cached prefix. Row-major `[batch, seq_len]`.
    pub fn padded_positions(&self) -> Vec<u32> {
        let mut positions = Vec::with_capacity(self.batch_size * self.seq_len);
        for b in 0..self.batch_size {
            let past = self.past_len(b) as u32;
            positions.extend((0..self.seq_len as u32).map(|t| past + t));
        }
        positions
    }
}
