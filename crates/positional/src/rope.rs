//! Rotary positional embedding engine.
//!
//! Angles follow the standard RoPE schedule: dimension pair `i` (of
//! `rotary_dim / 2`) at position `p` rotates by
//! `p * position_scale / base^(2i / rotary_dim)`. The scaling type only
//! changes how `base` and `position_scale` are resolved for a sequence; the
//! rotation itself is shared by every mode.

use candle_core::{bail, DType, Device, DeviceLocation, Result, Tensor};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

const SIN_COS_CACHE_CAPACITY: usize = 16;

static SIN_COS_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static SIN_COS_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Return the current `(hits, misses)` counters for the shared sin/cos cache.
pub fn sin_cos_cache_counters() -> (usize, usize) {
    (
        SIN_COS_CACHE_HITS.load(Ordering::Relaxed),
        SIN_COS_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

/// Reset the shared sin/cos cache counters.
pub fn reset_sin_cos_cache_stats() {
    SIN_COS_CACHE_HITS.store(0, Ordering::Relaxed);
    SIN_COS_CACHE_MISSES.store(0, Ordering::Relaxed);
}

struct SinCosCache {
    capacity: usize,
    order: Vec<String>,
    entries: HashMap<String, (Tensor, Tensor)>,
}

impl SinCosCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if pos + 1 == self.order.len() {
                return;
            }
            let key_owned = self.order.remove(pos);
            self.order.push(key_owned);
        }
    }

    fn get(&mut self, key: &str) -> Option<(Tensor, Tensor)> {
        let (sin, cos) = self.entries.get(key).cloned()?;
        self.touch(key);
        Some((sin, cos))
    }

    fn insert(&mut self, key: String, value: (Tensor, Tensor)) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key.clone(), value);
            self.touch(&key);
            return;
        }

        if self.entries.len() >= self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }

        self.order.push(key.clone());
        self.entries.insert(key, value);
    }
}

fn global_sin_cos_cache() -> &'static Mutex<SinCosCache> {
    static CACHE: OnceLock<Mutex<SinCosCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(SinCosCache::new(SIN_COS_CACHE_CAPACITY)))
}

/// How rotary angles are stretched for contexts beyond the trained length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotaryScalingType {
    /// Plain RoPE.
    #[default]
    None,
    /// Position interpolation: positions are multiplied by `1 / scale`.
    Linear,
    /// Dynamic NTK: once a sequence outgrows `max_positions`, the base is
    /// enlarged to `base * ((scale * len / max_positions) - (scale - 1))^(d / (d - 2))`.
    Dynamic,
}

/// Pairing layout of the rotated dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotaryStyle {
    /// Adjacent pairs `(2i, 2i + 1)`.
    #[default]
    Gptj,
    /// Split halves `(i, i + rotary_dim / 2)`.
    Neox,
}

/// Rotary configuration as carried by the model configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RotaryConfig {
    /// Number of leading dimensions per head that are rotated; `0` disables rotary.
    pub rotary_dim: usize,
    /// Base θ of the frequency spectrum.
    pub base: f32,
    /// Scaling variant applied on top of the base schedule.
    pub scaling: RotaryScalingType,
    /// Scaling factor consumed by [`RotaryScalingType::Linear`] and [`RotaryScalingType::Dynamic`].
    pub scale: f32,
    /// Trained context length; dynamic scaling kicks in past it.
    pub max_positions: usize,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            rotary_dim: 0,
            base: 10_000.0,
            scaling: RotaryScalingType::None,
            scale: 1.0,
            max_positions: 2048,
        }
    }
}

impl RotaryConfig {
    pub fn is_enabled(&self) -> bool {
        self.rotary_dim > 0
    }

    /// Check the rotary geometry against the per-head size.
    pub fn validate(&self, size_per_head: usize) -> Result<()> {
        if self.rotary_dim == 0 {
            return Ok(());
        }
        if self.rotary_dim > size_per_head {
            bail!(
                "rotary_dim {} exceeds size_per_head {}",
                self.rotary_dim,
                size_per_head
            );
        }
        if self.rotary_dim % 2 != 0 {
            bail!("rotary_dim must be even, got {}", self.rotary_dim);
        }
        if self.base.is_nan() || self.base <= 0.0 {
            bail!("rotary base must be positive, got {}", self.base);
        }
        match self.scaling {
            RotaryScalingType::None => {}
            RotaryScalingType::Linear => {
                if self.scale.is_nan() || self.scale <= 0.0 {
                    bail!("linear rotary scaling needs a positive scale");
                }
            }
            RotaryScalingType::Dynamic => {
                if self.rotary_dim <= 2 {
                    bail!("dynamic rotary scaling needs rotary_dim > 2");
                }
                if self.max_positions == 0 || self.scale.is_nan() || self.scale < 1.0 {
                    bail!("dynamic rotary scaling needs max_positions > 0 and scale >= 1");
                }
            }
        }
        Ok(())
    }

    /// Resolve the effective base and position multiplier for a sequence
    /// whose total context (cached + new tokens) is `context_len`.
    pub fn resolve(&self, context_len: usize) -> ResolvedRotary {
        let (base, position_scale) = match self.scaling {
            RotaryScalingType::None => (self.base, 1.0),
            RotaryScalingType::Linear => (self.base, 1.0 / self.scale),
            RotaryScalingType::Dynamic => {
                if context_len > self.max_positions {
                    let d = self.rotary_dim as f64;
                    let scale = self.scale as f64;
                    let growth =
                        scale * context_len as f64 / self.max_positions as f64 - (scale - 1.0);
                    let base = self.base as f64 * growth.powf(d / (d - 2.0));
                    (base as f32, 1.0)
                } else {
                    (self.base, 1.0)
                }
            }
        };
        ResolvedRotary {
            rotary_dim: self.rotary_dim,
            base,
            position_scale,
        }
    }
}

/// Base and position multiplier after scaling has been applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedRotary {
    pub rotary_dim: usize,
    pub base: f32,
    pub position_scale: f32,
}

impl ResolvedRotary {
    /// `base^(-2i / rotary_dim)` for every rotated pair `i`.
    pub fn inv_frequencies(&self) -> Vec<f64> {
        let half = self.rotary_dim / 2;
        let base = self.base as f64;
        (0..half)
            .map(|idx| base.powf(-((2 * idx) as f64) / self.rotary_dim as f64))
            .collect()
    }

    /// Rotation angle for pair `pair` at `position`.
    pub fn angle(&self, position: f64, pair: usize) -> f64 {
        let exponent = (2 * pair) as f64 / self.rotary_dim as f64;
        position * self.position_scale as f64 / (self.base as f64).powf(exponent)
    }

    /// Stable description used to key the shared table cache.
    pub fn fingerprint(&self) -> String {
        format!(
            "rot={};base={:.6};pscale={:.6}",
            self.rotary_dim, self.base, self.position_scale
        )
    }
}

/// Rotate the pair `(x0, x1)` by `angle` radians.
pub fn rotate_pair(x0: f32, x1: f32, angle: f64) -> (f32, f32) {
    let (sin, cos) = angle.sin_cos();
    let (x0, x1) = (x0 as f64, x1 as f64);
    ((x0 * cos - x1 * sin) as f32, (x1 * cos + x0 * sin) as f32)
}

fn device_tag(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_owned(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
    }
}

/// Retrieve (or lazily build) the sine/cosine tables covering positions
/// `[0, max_positions)`.
///
/// Tables are **f32** tensors shaped `[max_positions, rotary_dim / 2]` and
/// are shared through a bounded LRU keyed by geometry, resolved scaling and
/// device.
pub fn get_sin_cos(
    max_positions: usize,
    resolved: &ResolvedRotary,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    if max_positions == 0 {
        bail!("max_positions must be non-zero");
    }
    if resolved.rotary_dim < 2 || resolved.rotary_dim % 2 != 0 {
        bail!("rotary_dim must be even and at least 2");
    }

    let cache_key = format!(
        "seq={};{};dev={}",
        max_positions,
        resolved.fingerprint(),
        device_tag(device)
    );
    let cache = global_sin_cos_cache();
    {
        let mut guard = cache
            .lock()
            .map_err(|_| candle_core::Error::Msg("sin/cos cache lock poisoned".into()))?;
        if let Some(tables) = guard.get(&cache_key) {
            SIN_COS_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
            log::debug!("rope sin/cos cache hit: {}", cache_key);
            return Ok(tables);
        }
        log::debug!("rope sin/cos cache miss: {}", cache_key);
        SIN_COS_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
    }

    let half_dim = resolved.rotary_dim / 2;
    let inv_freqs = resolved.inv_frequencies();
    let position_scale = resolved.position_scale as f64;

    let mut sin_data = Vec::with_capacity(max_positions * half_dim);
    let mut cos_data = Vec::with_capacity(max_positions * half_dim);
    for pos in 0..max_positions {
        let pos_f = pos as f64 * position_scale;
        for &inv_freq in &inv_freqs {
            let (sin, cos) = (pos_f * inv_freq).sin_cos();
            sin_data.push(sin as f32);
            cos_data.push(cos as f32);
        }
    }

    let sin = Tensor::from_vec(sin_data, (max_positions, half_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (max_positions, half_dim), device)?;

    let mut guard = cache
        .lock()
        .map_err(|_| candle_core::Error::Msg("sin/cos cache lock poisoned".into()))?;
    if let Some(tables) = guard.get(&cache_key) {
        return Ok(tables);
    }
    guard.insert(cache_key, (sin.clone(), cos.clone()));

    Ok((sin, cos))
}

/// Gather table rows for arbitrary (possibly non-contiguous) positions.
///
/// Returns `(sin, cos)` shaped `[positions.len(), rotary_dim / 2]`.
pub fn sin_cos_rows(
    resolved: &ResolvedRotary,
    positions: &[u32],
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    let Some(&max_pos) = positions.iter().max() else {
        bail!("positions must not be empty");
    };
    // Round coverage up so consecutive decode steps reuse one table.
    let coverage = (max_pos as usize + 1).next_power_of_two();
    let (sin, cos) = get_sin_cos(coverage, resolved, device)?;
    let indices = Tensor::from_vec(positions.to_vec(), (positions.len(),), device)?;
    Ok((sin.index_select(&indices, 0)?, cos.index_select(&indices, 0)?))
}

/// Apply rotary embeddings to `x` shaped `[batch, heads, seq_len, head_dim]`.
///
/// * `sin`/`cos` are f32 and shaped `[batch, seq_len, rotary_dim / 2]`; each
///   token carries its own angles so speculative (non-contiguous) positions
///   need no special casing.
/// * Only the leading `rotary_dim` components are rotated; the tail is copied
///   through unchanged.
/// * The output mirrors the dtype of `x`.
pub fn apply_rotary(
    x: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    rotary_dim: usize,
    style: RotaryStyle,
) -> Result<Tensor> {
    let (batch, heads, seq_len, head_dim) = x.dims4()?;
    if rotary_dim == 0 {
        return Ok(x.clone());
    }
    if rotary_dim > head_dim || rotary_dim % 2 != 0 {
        bail!(
            "invalid rotary_dim {} for head_dim {}",
            rotary_dim,
            head_dim
        );
    }
    let half_dim = rotary_dim / 2;
    debug_assert_eq!(sin.dims(), &[batch, seq_len, half_dim], "sin table shape");
    debug_assert_eq!(cos.dims(), &[batch, seq_len, half_dim], "cos table shape");

    let sin_b = sin
        .reshape((batch, 1, seq_len, half_dim))?
        .broadcast_as((batch, heads, seq_len, half_dim))?;
    let cos_b = cos
        .reshape((batch, 1, seq_len, half_dim))?
        .broadcast_as((batch, heads, seq_len, half_dim))?;

    let dtype = x.dtype();
    let main = x.narrow(3, 0, rotary_dim)?.to_dtype(DType::F32)?;
    let (first, second) = match style {
        RotaryStyle::Gptj => {
            let pairs = main.reshape((batch, heads, seq_len, half_dim, 2))?;
            (
                pairs.narrow(4, 0, 1)?.squeeze(4)?,
                pairs.narrow(4, 1, 1)?.squeeze(4)?,
            )
        }
        RotaryStyle::Neox => (main.narrow(3, 0, half_dim)?, main.narrow(3, half_dim, half_dim)?),
    };

    let rotated_first = first.mul(&cos_b)?.sub(&second.mul(&sin_b)?)?;
    let rotated_second = second.mul(&cos_b)?.add(&first.mul(&sin_b)?)?;

    let rotated = match style {
        RotaryStyle::Gptj => Tensor::cat(
            &[&rotated_first.unsqueeze(4)?, &rotated_second.unsqueeze(4)?],
            4,
        )?
        .reshape((batch, heads, seq_len, rotary_dim))?,
        RotaryStyle::Neox => Tensor::cat(&[&rotated_first, &rotated_second], 3)?,
    }
    .to_dtype(dtype)?;

    let tail_dim = head_dim - rotary_dim;
    if tail_dim == 0 {
        Ok(rotated)
    } else {
        let tail = x.narrow(3, rotary_dim, tail_dim)?;
        Tensor::cat(&[&rotated, &tail], 3)
    }
}

/// Rotary engine bound to one configuration and pairing layout.
#[derive(Debug, Clone, PartialEq)]
pub struct RotaryEngine {
    config: RotaryConfig,
    style: RotaryStyle,
}

impl RotaryEngine {
    /// Construct the engine, rejecting geometry that cannot be rotated.
    pub fn new(config: RotaryConfig, style: RotaryStyle, size_per_head: usize) -> Result<Self> {
        config.validate(size_per_head)?;
        Ok(Self { config, style })
    }

    pub fn config(&self) -> &RotaryConfig {
        &self.config
    }

    pub fn style(&self) -> RotaryStyle {
        self.style
    }

    pub fn rotary_dim(&self) -> usize {
        self.config.rotary_dim
    }

    /// Build per-token tables for a batch.
    ///
    /// `positions` holds `batch * seq_len` position ids (row-major by
    /// sequence) and `context_lens` the total context of each sequence, which
    /// only matters for dynamic scaling. Returns `(sin, cos)` shaped
    /// `[batch, seq_len, rotary_dim / 2]`.
    pub fn batch_tables(
        &self,
        positions: &[u32],
        seq_len: usize,
        context_lens: &[usize],
        device: &Device,
    ) -> Result<(Tensor, Tensor)> {
        let batch = context_lens.len();
        if positions.len() != batch * seq_len {
            bail!(
                "expected {} positions for batch {} x seq_len {}, got {}",
                batch * seq_len,
                batch,
                seq_len,
                positions.len()
            );
        }
        let half_dim = self.config.rotary_dim / 2;
        if positions.is_empty() {
            let empty = Tensor::zeros((batch, seq_len, half_dim), DType::F32, device)?;
            return Ok((empty.clone(), empty));
        }
        let resolved: Vec<ResolvedRotary> = context_lens
            .iter()
            .map(|&len| self.config.resolve(len))
            .collect();

        if resolved.windows(2).all(|w| w[0] == w[1]) {
            let (sin, cos) = sin_cos_rows(&resolved[0], positions, device)?;
            return Ok((
                sin.reshape((batch, seq_len, half_dim))?,
                cos.reshape((batch, seq_len, half_dim))?,
            ));
        }

        let mut sins = Vec::with_capacity(batch);
        let mut coss = Vec::with_capacity(batch);
        for (b, resolved) in resolved.iter().enumerate() {
            let rows = &positions[b * seq_len..(b + 1) * seq_len];
            let (sin, cos) = sin_cos_rows(resolved, rows, device)?;
            sins.push(sin);
            coss.push(cos);
        }
        Ok((Tensor::stack(&sins, 0)?, Tensor::stack(&coss, 0)?))
    }

    /// Rotate `x` (`[batch, heads, seq_len, head_dim]`) with precomputed tables.
    pub fn apply(&self, x: &Tensor, sin: &Tensor, cos: &Tensor) -> Result<Tensor> {
        apply_rotary(x, sin, cos, self.config.rotary_dim, self.style)
    }

    /// Rotate one head vector in place on the host.
    pub fn rotate_vector(&self, vector: &mut [f32], position: f64, context_len: usize) {
        let resolved = self.config.resolve(context_len);
        let half_dim = self.config.rotary_dim / 2;
        debug_assert!(vector.len() >= self.config.rotary_dim);
        for pair in 0..half_dim {
            let (i0, i1) = match self.style {
                RotaryStyle::Gptj => (2 * pair, 2 * pair + 1),
                RotaryStyle::Neox => (pair, pair + half_dim),
            };
            let (r0, r1) = rotate_pair(vector[i0], vector[i1], resolved.angle(position, pair));
            vector[i0] = r0;
            vector[i1] = r1;
        }
    }
}
