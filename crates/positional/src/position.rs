//! Selection of the positional scheme applied to queries, keys and logits.

use serde::Deserialize;

use crate::rope::RotaryStyle;

/// Which positional encoding a model uses.
///
/// Rotary variants transform Q/K before the cache write; ALiBi and relative
/// variants leave Q/K untouched and contribute an additive logit bias instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbeddingType {
    /// Learned absolute embeddings, already folded into the projection input.
    #[default]
    LearnedAbsolute,
    /// Rotary embedding over adjacent dimension pairs `(2i, 2i + 1)`.
    RopeGptj,
    /// Rotary embedding pairing dimension `i` with `i + rotary_dim / 2`.
    RopeGptNeox,
    /// Linear distance penalty with per-head slopes.
    Alibi,
    /// ALiBi with slopes divided by `sqrt(size_per_head)`.
    AlibiWithScale,
    /// Learned relative-position bucket bias.
    Relative,
}

impl PositionEmbeddingType {
    pub fn is_rope(self) -> bool {
        matches!(self, Self::RopeGptj | Self::RopeGptNeox)
    }

    pub fn is_alibi(self) -> bool {
        matches!(self, Self::Alibi | Self::AlibiWithScale)
    }

    pub fn is_relative(self) -> bool {
        matches!(self, Self::Relative)
    }

    /// Rotary pairing layout, or `None` for non-rotary schemes.
    pub fn rotary_style(self) -> Option<RotaryStyle> {
        match self {
            Self::RopeGptj => Some(RotaryStyle::Gptj),
            Self::RopeGptNeox => Some(RotaryStyle::Neox),
            _ => None,
        }
    }
}
