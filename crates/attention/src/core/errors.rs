//! Error types emitted at configuration and setup boundaries.
//!
//! Per-element preconditions inside the kernels are debug assertions; only
//! geometry/configuration mismatches detected before any work is issued, and
//! failures propagated from the tensor backend, surface here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AttentionError>;

#[derive(Error, Debug)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },

    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },

    /// Configuration validation failed; all problems are listed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A backend failure propagated from candle.
    #[error("backend error: {0}")]
    Backend(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("serde_json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn shape_err<S: Into<String>>(context: S) -> AttentionError {
    AttentionError::InvalidShape {
        context: context.into(),
    }
}
