//! Cache addressing strategies.
//!
//! Both layouts back the cache with one pool of rows shaped
//! `[rows, kv_head_num, size_per_head]`; they differ only in which row holds
//! slot `s` of sequence `q`:
//!
//! * [`LinearAddressing`]: `q * capacity + s`.
//! * [`PagedAddressing`]: `block_table[q][s / tokens_per_block] *
//!   tokens_per_block + s % tokens_per_block`.

use crate::core::errors::{shape_err, Result};

/// Maps `(sequence, slot)` to a row of the cache pool.
pub trait CacheAddressing {
    /// Sequences (batch × beam slots) the cache serves.
    fn sequences(&self) -> usize;

    /// Slots available to each sequence.
    fn capacity(&self) -> usize;

    /// Rows in the backing pool.
    fn pool_rows(&self) -> usize;

    /// Pool row holding `slot` of `sequence`.
    fn row(&self, sequence: usize, slot: usize) -> usize;
}

/// One contiguous region per sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearAddressing {
    sequences: usize,
    capacity: usize,
}

impl LinearAddressing {
    pub fn new(sequences: usize, capacity: usize) -> Self {
        Self {
            sequences,
            capacity,
        }
    }
}

impl CacheAddressing for LinearAddressing {
    fn sequences(&self) -> usize {
        self.sequences
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn pool_rows(&self) -> usize {
        self.sequences * self.capacity
    }

    #[inline]
    fn row(&self, sequence: usize, slot: usize) -> usize {
        debug_assert!(sequence < self.sequences && slot < self.capacity);
        sequence * self.capacity + slot
    }
}

/// Per-sequence lists of physical block ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTable {
    tokens_per_block: usize,
    blocks: Vec<Vec<u32>>,
}

impl BlockTable {
    /// Table from externally allocated blocks. Every sequence must own the
    /// same number of blocks and no block may be shared.
    pub fn new(tokens_per_block: usize, blocks: Vec<Vec<u32>>) -> Result<Self> {
        if tokens_per_block == 0 {
            return Err(shape_err("tokens_per_block must be greater than zero"));
        }
        let per_sequence = blocks.first().map(Vec::len).unwrap_or(0);
        if blocks.iter().any(|row| row.len() != per_sequence) {
            return Err(shape_err("every sequence must own the same number of blocks"));
        }
        let mut seen: Vec<u32> = blocks.iter().flatten().copied().collect();
        seen.sort_unstable();
        if seen.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(shape_err("block ids must not be shared between slots"));
        }
        Ok(Self {
            tokens_per_block,
            blocks,
        })
    }

    /// Blocks handed out in order: sequence `q` owns
    /// `[q * blocks_per_sequence, (q + 1) * blocks_per_sequence)`.
    pub fn contiguous(sequences: usize, capacity: usize, tokens_per_block: usize) -> Result<Self> {
        let per_sequence = capacity.div_ceil(tokens_per_block.max(1));
        let blocks = (0..sequences)
            .map(|q| {
                (0..per_sequence)
                    .map(|b| (q * per_sequence + b) as u32)
                    .collect()
            })
            .collect();
        Self::new(tokens_per_block, blocks)
    }

    pub fn tokens_per_block(&self) -> usize {
        self.tokens_per_block
    }

    pub fn blocks(&self, sequence: usize) -> &[u32] {
        &self.blocks[sequence]
    }

    fn blocks_per_sequence(&self) -> usize {
        self.blocks.first().map(Vec::len).unwrap_or(0)
    }

    fn max_block(&self) -> Option<u32> {
        self.blocks.iter().flatten().copied().max()
    }
}

/// Block-table indirection for generation-phase paged attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedAddressing {
    table: BlockTable,
}

impl PagedAddressing {
    pub fn new(table: BlockTable) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &BlockTable {
        &self.table
    }
}

impl CacheAddressing for PagedAddressing {
    fn sequences(&self) -> usize {
        self.table.blocks.len()
    }

    fn capacity(&self) -> usize {
        self.table.blocks_per_sequence() * self.table.tokens_per_block
    }

    fn pool_rows(&self) -> usize {
        self.table
            .max_block()
            .map(|max| (max as usize + 1) * self.table.tokens_per_block)
            .unwrap_or(0)
    }

    #[inline]
    fn row(&self, sequence: usize, slot: usize) -> usize {
        let tpb = self.table.tokens_per_block;
        let block = self.table.blocks[sequence][slot / tpb] as usize;
        block * tpb + slot % tpb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_rows_are_sequence_major() {
        let linear = LinearAddressing::new(3, 8);
        assert_eq!(linear.pool_rows(), 24);
        assert_eq!(linear.row(2, 5), 21);
    }

    #[test]
    fn paged_rows_follow_block_table() -> Result<()> {
        let table = BlockTable::new(4, vec![vec![5, 0], vec![2, 7]])?;
        let paged = PagedAddressing::new(table);
        assert_eq!(paged.capacity(), 8);
        assert_eq!(paged.pool_rows(), 32);
        assert_eq!(paged.row(0, 0), 20);
        assert_eq!(paged.row(0, 6), 2);
        assert_eq!(paged.row(1, 5), 29);
        Ok(())
    }

    #[test]
    fn contiguous_table_matches_linear_layout() -> Result<()> {
        let paged = PagedAddressing::new(BlockTable::contiguous(2, 8, 4)?);
        let linear = LinearAddressing::new(2, 8);
        for q in 0..2 {
            for s in 0..8 {
                assert_eq!(paged.row(q, s), linear.row(q, s));
            }
        }
        Ok(())
    }

    #[test]
    fn shared_blocks_are_rejected() {
        assert!(BlockTable::new(4, vec![vec![1, 2], vec![2, 3]]).is_err());
        assert!(BlockTable::new(4, vec![vec![1, 2], vec![3]]).is_err());
        assert!(BlockTable::new(0, vec![vec![1]]).is_err());
    }
}
