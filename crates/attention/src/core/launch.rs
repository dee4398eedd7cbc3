//! Launch shapes for the table-building passes.
//!
//! Each kernel splits its work items (tokens, cache rows, logits rows) into
//! groups. The grouping depends only on the kernel, the problem shape and
//! the enabled features, so callers keep a [`LaunchCache`] alive across
//! steps and look the shape up instead of recomputing it.

use std::collections::HashMap;

use rayon::prelude::*;

/// Upper bound on work items handled by one group.
pub const MAX_GROUP_SIZE: usize = 1024;

/// Work split for one kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchConfig {
    /// Number of groups.
    pub grid: usize,
    /// Work items per group.
    pub block: usize,
}

impl LaunchConfig {
    /// Split `items` into at most [`MAX_GROUP_SIZE`]-sized groups, keeping the
    /// group size a multiple of `granularity` (e.g. head dimension pairs).
    pub fn for_items(items: usize, granularity: usize) -> Self {
        let granularity = granularity.max(1);
        let target = (items.max(1)).min(MAX_GROUP_SIZE);
        let block = target.div_ceil(granularity) * granularity;
        let grid = items.div_ceil(block).max(1);
        Self { grid, block }
    }

    pub fn covers(&self, items: usize) -> bool {
        self.grid * self.block >= items
    }
}

/// Key identifying a distinct launch shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaunchKey {
    pub kernel: &'static str,
    pub shape: Vec<usize>,
    pub flags: u32,
}

impl LaunchKey {
    pub fn new(kernel: &'static str, shape: &[usize], flags: u32) -> Self {
        Self {
            kernel,
            shape: shape.to_vec(),
            flags,
        }
    }
}

/// Caller-owned memo of launch configurations.
#[derive(Debug, Default)]
pub struct LaunchCache {
    entries: HashMap<LaunchKey, LaunchConfig>,
    hits: usize,
    misses: usize,
}

impl LaunchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the memoized configuration for `key`, computing it from
    /// `items`/`granularity` on first use.
    pub fn get_or_compute(&mut self, key: LaunchKey, items: usize, granularity: usize) -> LaunchConfig {
        if let Some(config) = self.entries.get(&key) {
            self.hits += 1;
            log::debug!("launch cache hit: {}{:?}", key.kernel, key.shape);
            return *config;
        }
        self.misses += 1;
        let config = LaunchConfig::for_items(items, granularity);
        log::debug!(
            "launch cache miss: {}{:?} -> grid={} block={}",
            key.kernel,
            key.shape,
            config.grid,
            config.block
        );
        self.entries.insert(key, config);
        config
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since construction.
    pub fn counters(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}

/// Evaluate `item` for every index in `0..items`, one rayon task per launch
/// group. The result preserves index order.
pub fn build_table<T, F>(launch: &LaunchConfig, items: usize, item: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    debug_assert!(launch.covers(items), "launch does not cover {items} items");
    (0..items)
        .into_par_iter()
        .with_min_len(launch.block)
        .map(item)
        .collect()
}
