//! Relative-position bucketing for learned bias tables.
//!
//! Distances `query_pos - key_pos` shorter than half the (per-direction)
//! bucket count map to their own bucket; longer distances share
//! logarithmically spaced buckets up to `max_distance`, and everything beyond
//! lands in the last bucket.

use candle_core::{bail, Device, Result, Tensor};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RelativeBucketing {
    pub num_buckets: usize,
    pub max_distance: usize,
    /// When `false` only keys at or before the query get distinct buckets.
    #[serde(default = "default_bidirectional")]
    pub bidirectional: bool,
}

fn default_bidirectional() -> bool {
    true
}

impl RelativeBucketing {
    pub fn new(num_buckets: usize, max_distance: usize, bidirectional: bool) -> Result<Self> {
        let bucketing = Self {
            num_buckets,
            max_distance,
            bidirectional,
        };
        bucketing.validate()?;
        Ok(bucketing)
    }

    pub fn validate(&self) -> Result<()> {
        let per_direction = if self.bidirectional {
            self.num_buckets / 2
        } else {
            self.num_buckets
        };
        let max_exact = per_direction / 2;
        if max_exact == 0 {
            bail!(
                "num_buckets {} too small (bidirectional: {})",
                self.num_buckets,
                self.bidirectional
            );
        }
        if self.max_distance <= max_exact {
            bail!(
                "max_distance {} must exceed the exact range {}",
                self.max_distance,
                max_exact
            );
        }
        Ok(())
    }

    /// Bucket index for one (query, key) position pair.
    pub fn bucket(&self, query_pos: usize, key_pos: usize) -> u32 {
        let mut n = query_pos as i64 - key_pos as i64;
        let mut num_buckets = self.num_buckets as i64;
        let mut bucket = 0i64;
        if self.bidirectional {
            num_buckets /= 2;
            if n < 0 {
                bucket += num_buckets;
            }
            n = n.abs();
        } else {
            n = n.max(0);
        }

        let max_exact = num_buckets / 2;
        if n < max_exact {
            return (bucket + n) as u32;
        }
        let ratio = (n as f32 / max_exact as f32).ln()
            / (self.max_distance as f32 / max_exact as f32).ln();
        let large = max_exact + (ratio * (num_buckets - max_exact) as f32) as i64;
        (bucket + large.min(num_buckets - 1)) as u32
    }

    /// Row-major `[q_len, k_len]` bucket indices with the query aligned to the
    /// end of the key range.
    pub fn bucket_table(&self, q_len: usize, k_len: usize) -> Vec<u32> {
        let offset = k_len.saturating_sub(q_len);
        let mut table = Vec::with_capacity(q_len * k_len);
        for i in 0..q_len {
            for j in 0..k_len {
                table.push(self.bucket(i + offset, j));
            }
        }
        table
    }

    /// Expand a learned `[heads, num_buckets]` table into a dense
    /// `[heads, q_len, k_len]` bias.
    pub fn bias(&self, weights: &Tensor, q_len: usize, k_len: usize) -> Result<Tensor> {
        let (heads, buckets) = weights.dims2()?;
        if buckets != self.num_buckets {
            bail!(
                "bias table has {} buckets, bucketing expects {}",
                buckets,
                self.num_buckets
            );
        }
        let device: &Device = weights.device();
        let indices = Tensor::from_vec(self.bucket_table(q_len, k_len), (q_len * k_len,), device)?;
        weights
            .index_select(&indices, 1)?
            .reshape((heads, q_len, k_len))
    }
}
