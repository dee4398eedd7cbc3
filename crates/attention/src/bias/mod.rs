//! Additive logit biases: ALiBi linear decay and learned relative-position
//! buckets.

pub mod alibi;
pub mod relative;

pub use alibi::{add_alibi_bias, alibi_slopes_for};
pub use relative::{add_relative_attention_bias, RelativeAttentionBias};
