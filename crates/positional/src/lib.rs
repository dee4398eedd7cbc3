//! Position engines consumed by the attention preparation kernels.
//!
//! * [`rope`] builds rotary sine/cosine tables (with linear and dynamic-NTK
//!   scaling) and rotates query/key tensors laid out as
//!   `[batch, heads, seq_len, head_dim]`.
//! * [`alibi`] produces per-head linear-bias slopes and analytic bias tiles.
//! * [`relative`] maps query/key distances into learned bias buckets.
//!
//! Every table is computed in `f32`; tensors handed in at lower precision are
//! promoted for the rotation and cast back afterwards.

pub mod alibi;
pub mod position;
pub mod relative;
pub mod rope;

pub use alibi::{alibi_bias, alibi_slopes, alibi_slopes_scaled};
pub use position::PositionEmbeddingType;
pub use relative::RelativeBucketing;
pub use rope::{
    apply_rotary, rotate_pair, ResolvedRotary, RotaryConfig, RotaryEngine, RotaryScalingType,
    RotaryStyle,
};
