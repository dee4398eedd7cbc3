//! Bridge between the preparation kernels and the `positional` rotary engine.
//!
//! The adapter owns a [`RotaryEngine`] plus the device tables are uploaded
//! to, and exposes the three position sources the kernels need:
//! sequential/speculative token positions, explicit position lists, and
//! relative shifts (negative deltas) used when re-rotating cached keys.

use candle_core::{Device, Tensor};
use positional::{RotaryEngine, RotaryStyle};

use crate::core::errors::{AttentionError, Result};
use crate::core::Config;

#[derive(Debug, Clone)]
pub struct RopeAdapter {
    engine: RotaryEngine,
    device: Device,
}

impl RopeAdapter {
    /// Adapter for `config`, or `None` when the position scheme does not rotate.
    pub fn from_config(config: &Config, device: &Device) -> Result<Option<Self>> {
        let Some(style) = config.position_embedding_type.rotary_style() else {
            return Ok(None);
        };
        if !config.rotary.is_enabled() {
            return Ok(None);
        }
        let engine = RotaryEngine::new(config.rotary.clone(), style, config.geometry.size_per_head)
            .map_err(|err| AttentionError::InvalidConfig(format!("rotary: {err}")))?;
        Ok(Some(Self {
            engine,
            device: device.clone(),
        }))
    }

    pub fn engine(&self) -> &RotaryEngine {
        &self.engine
    }

    pub fn style(&self) -> RotaryStyle {
        self.engine.style()
    }

    pub fn rotary_dim(&self) -> usize {
        self.engine.rotary_dim()
    }

    /// Per-token tables for `positions` laid out `[batch, seq_len]`, where
    /// `context_lens[b]` drives dynamic scaling for sequence `b`.
    pub fn tables(
        &self,
        positions: &[u32],
        seq_len: usize,
        context_lens: &[usize],
    ) -> Result<(Tensor, Tensor)> {
        Ok(self
            .engine
            .batch_tables(positions, seq_len, context_lens, &self.device)?)
    }

    /// Rotate `x` (`[batch, heads, seq_len, head_dim]`) at the given
    /// per-token positions.
    pub fn rotate(&self, x: &Tensor, positions: &[u32], context_lens: &[usize]) -> Result<Tensor> {
        let (_, _, seq_len, _) = x.dims4()?;
        let (sin, cos) = self.tables(positions, seq_len, context_lens)?;
        Ok(self.engine.apply(x, &sin, &cos)?)
    }

    /// Rotate `x` backwards by `deltas` (each token is rotated by
    /// `-deltas[i]` positions).
    pub fn rotate_back(&self, x: &Tensor, deltas: &[u32], context_lens: &[usize]) -> Result<Tensor> {
        let (_, _, seq_len, _) = x.dims4()?;
        let (sin, cos) = self.tables(deltas, seq_len, context_lens)?;
        Ok(self.engine.apply(x, &sin.neg()?, &cos)?)
    }
}
