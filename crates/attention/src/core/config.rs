//! Plain-value configuration consumed by every kernel entry point.
//!
//! A [`Config`] is loaded once (from TOML/JSON or built in code), validated
//! with [`Config::validate`], and then passed by reference. Feature toggles
//! that would otherwise be inferred from missing buffers (output
//! quantization, cache precision, paged addressing, position scheme) are
//! explicit fields here.

use std::{fs, path::Path};

use positional::{PositionEmbeddingType, RelativeBucketing, RotaryConfig};
use serde::Deserialize;

use super::errors::{AttentionError, Result};
use crate::kv_cache::KvCacheDataType;

/// Head counts and per-head width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HeadGeometry {
    pub head_num: usize,
    /// Key/value heads; each serves `head_num / kv_head_num` query heads.
    pub kv_head_num: usize,
    pub size_per_head: usize,
}

impl HeadGeometry {
    pub fn new(head_num: usize, kv_head_num: usize, size_per_head: usize) -> Self {
        Self {
            head_num,
            kv_head_num,
            size_per_head,
        }
    }

    /// Width of the query section of a fused projection row.
    pub fn q_hidden(&self) -> usize {
        self.head_num * self.size_per_head
    }

    /// Width of the key (or value) section of a fused projection row.
    pub fn kv_hidden(&self) -> usize {
        self.kv_head_num * self.size_per_head
    }

    /// Full fused projection row: `[Q | K | V]`.
    pub fn qkv_hidden(&self) -> usize {
        self.q_hidden() + 2 * self.kv_hidden()
    }

    /// Query heads sharing one key/value head.
    pub fn group_size(&self) -> usize {
        self.head_num / self.kv_head_num.max(1)
    }
}

/// Output narrowing applied by the transpose kernels (`int8_mode`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputQuantization {
    #[default]
    None,
    /// Values are multiplied by `scale`, rounded and stored as int8 codes.
    Int8 { scale: f32 },
}

/// Cache precision, addressing and window settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    pub cache_type: KvCacheDataType,
    /// Scale applied before narrowing (`kvScaleOrigQuant`); required for int8/fp8.
    pub kv_scale_orig_quant: Option<f32>,
    /// Select block-table addressing instead of one contiguous region per sequence.
    pub enable_paged_kv_fmha: bool,
    pub tokens_per_block: usize,
    /// Slots per sequence; sequences longer than this wrap (`cyclic_kv_cache_len`).
    pub max_attention_window_size: usize,
    /// Earliest tokens that are never evicted by the window.
    pub sink_token_len: usize,
    pub beam_width: usize,
    /// Store keys unrotated and rotate them at their in-window position on read.
    pub position_shift_enabled: bool,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            cache_type: KvCacheDataType::Base,
            kv_scale_orig_quant: None,
            enable_paged_kv_fmha: false,
            tokens_per_block: 64,
            max_attention_window_size: 2048,
            sink_token_len: 0,
            beam_width: 1,
            position_shift_enabled: false,
        }
    }
}

/// Configuration driving the preparation and cache kernels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub geometry: HeadGeometry,
    #[serde(default)]
    pub position_embedding_type: PositionEmbeddingType,
    #[serde(default)]
    pub rotary: RotaryConfig,
    /// Bucketing for [`PositionEmbeddingType::Relative`] when biases are computed implicitly.
    #[serde(default)]
    pub relative: Option<RelativeBucketing>,
    #[serde(default)]
    pub output_quantization: OutputQuantization,
    #[serde(default)]
    pub cache: KvCacheConfig,
}

impl Config {
    /// Configuration with defaults for everything except the head geometry.
    pub fn new(geometry: HeadGeometry) -> Self {
        Self {
            geometry,
            position_embedding_type: PositionEmbeddingType::default(),
            rotary: RotaryConfig::default(),
            relative: None,
            output_quantization: OutputQuantization::None,
            cache: KvCacheConfig::default(),
        }
    }

    /// Load a configuration file (`.toml` or `.json`), apply environment
    /// overrides and validate the result.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: Config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(AttentionError::InvalidConfig(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        log::info!(
            "attention config loaded from {}: heads={} kv_heads={} head_dim={} pos={:?} cache={:?} paged={}",
            path.display(),
            config.geometry.head_num,
            config.geometry.kv_head_num,
            config.geometry.size_per_head,
            config.position_embedding_type,
            config.cache.cache_type,
            config.cache.enable_paged_kv_fmha
        );
        Ok(config)
    }

    /// Apply `ATTN_KV_CACHE_TYPE`, `ATTN_PAGED_KV`, `ATTN_SINK_TOKENS` and
    /// `ROPE_THETA` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("ATTN_KV_CACHE_TYPE") {
            self.cache.cache_type = raw.parse()?;
        }
        if let Some(raw) = lookup("ATTN_PAGED_KV") {
            self.cache.enable_paged_kv_fmha = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(AttentionError::InvalidConfig(format!(
                        "ATTN_PAGED_KV must be a boolean, got '{other}'"
                    )))
                }
            };
        }
        if let Some(raw) = lookup("ATTN_SINK_TOKENS") {
            self.cache.sink_token_len = raw.trim().parse().map_err(|_| {
                AttentionError::InvalidConfig(format!("ATTN_SINK_TOKENS must be an integer, got '{raw}'"))
            })?;
        }
        if let Some(raw) = lookup("ROPE_THETA") {
            self.rotary.base = raw.trim().parse().map_err(|_| {
                AttentionError::InvalidConfig(format!("ROPE_THETA must be a number, got '{raw}'"))
            })?;
        }
        Ok(())
    }

    /// Check every setup-time invariant, reporting all violations at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let geometry = &self.geometry;

        if geometry.head_num == 0 || geometry.kv_head_num == 0 || geometry.size_per_head == 0 {
            errors.push("geometry.head_num, kv_head_num and size_per_head must be > 0".to_string());
        } else if geometry.kv_head_num > geometry.head_num
            || geometry.head_num % geometry.kv_head_num != 0
        {
            errors.push(format!(
                "geometry.head_num ({}) must be a multiple of geometry.kv_head_num ({})",
                geometry.head_num, geometry.kv_head_num
            ));
        }

        if self.position_embedding_type.is_rope() {
            if !self.rotary.is_enabled() {
                errors.push("rotary position embedding requires rotary.rotary_dim > 0".to_string());
            }
            if let Err(err) = self.rotary.validate(geometry.size_per_head) {
                errors.push(format!("rotary: {err}"));
            }
        }

        if let Some(relative) = &self.relative {
            if let Err(err) = relative.validate() {
                errors.push(format!("relative: {err}"));
            }
        }

        if let OutputQuantization::Int8 { scale } = self.output_quantization {
            if !(scale.is_finite() && scale > 0.0) {
                errors.push("output_quantization.scale must be positive".to_string());
            }
        }

        let cache = &self.cache;
        if cache.cache_type.is_quantized() {
            match cache.kv_scale_orig_quant {
                Some(scale) if scale.is_finite() && scale > 0.0 => {}
                Some(_) => errors.push("cache.kv_scale_orig_quant must be positive".to_string()),
                None => errors.push(format!(
                    "cache.kv_scale_orig_quant is required for {:?} caches",
                    cache.cache_type
                )),
            }
        }
        if cache.enable_paged_kv_fmha && cache.tokens_per_block == 0 {
            errors.push("cache.tokens_per_block must be greater than 0".to_string());
        }
        if cache.max_attention_window_size == 0 {
            errors.push("cache.max_attention_window_size must be greater than 0".to_string());
        }
        if cache.sink_token_len >= cache.max_attention_window_size {
            errors.push(format!(
                "cache.sink_token_len ({}) must be smaller than cache.max_attention_window_size ({})",
                cache.sink_token_len, cache.max_attention_window_size
            ));
        }
        if cache.beam_width == 0 {
            errors.push("cache.beam_width must be greater than 0".to_string());
        }
        if cache.position_shift_enabled && !self.position_embedding_type.is_rope() {
            errors.push("cache.position_shift_enabled requires a rotary position embedding".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::InvalidConfig(errors.join("; ")))
        }
    }

    /// Scale applied to cache writes, or `1.0` for full-precision caches.
    pub fn kv_scale(&self) -> f32 {
        self.cache.kv_scale_orig_quant.unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use positional::RotaryScalingType;
    use std::collections::HashMap;

    fn geometry() -> HeadGeometry {
        HeadGeometry::new(8, 2, 64)
    }

    #[test]
    fn parses_toml_with_defaults() {
        let raw = r#"
            position_embedding_type = "rope_gpt_neox"

            [geometry]
            head_num = 8
            kv_head_num = 2
            size_per_head = 64

            [rotary]
            rotary_dim = 64
            scaling = "linear"
            scale = 2.0

            [cache]
            cache_type = "int8"
            kv_scale_orig_quant = 12.5
            sink_token_len = 4
            max_attention_window_size = 256
        "#;
        let config: Config = toml::from_str(raw).expect("parse");
        assert_eq!(config.geometry, geometry());
        assert_eq!(config.rotary.scaling, RotaryScalingType::Linear);
        assert_eq!(config.cache.cache_type, KvCacheDataType::Int8);
        assert_eq!(config.cache.tokens_per_block, 64);
        assert_eq!(config.output_quantization, OutputQuantization::None);
        config.validate().expect("valid");
    }

    #[test]
    fn parses_json_output_quantization() {
        let raw = r#"{
            "geometry": {"head_num": 4, "kv_head_num": 4, "size_per_head": 16},
            "output_quantization": {"mode": "int8", "scale": 0.5}
        }"#;
        let config: Config = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.output_quantization, OutputQuantization::Int8 { scale: 0.5 });
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = Config::new(HeadGeometry::new(6, 4, 64));
        config.position_embedding_type = PositionEmbeddingType::RopeGptj;
        config.rotary.rotary_dim = 65;
        config.cache.cache_type = KvCacheDataType::Fp8;
        config.cache.sink_token_len = 4096;

        let err = config.validate().expect_err("invalid");
        let message = err.to_string();
        assert!(message.contains("multiple of geometry.kv_head_num"), "{message}");
        assert!(message.contains("rotary"), "{message}");
        assert!(message.contains("kv_scale_orig_quant is required"), "{message}");
        assert!(message.contains("sink_token_len"), "{message}");
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = [
            ("ATTN_KV_CACHE_TYPE", "fp8"),
            ("ATTN_PAGED_KV", "true"),
            ("ATTN_SINK_TOKENS", "4"),
            ("ROPE_THETA", "500000"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::new(geometry());
        config
            .apply_overrides_from(|key| env.get(key).map(|v| v.to_string()))
            .expect("overrides");
        assert_eq!(config.cache.cache_type, KvCacheDataType::Fp8);
        assert!(config.cache.enable_paged_kv_fmha);
        assert_eq!(config.cache.sink_token_len, 4);
        assert_eq!(config.rotary.base, 500_000.0);

        let bad = config.apply_overrides_from(|key| (key == "ATTN_PAGED_KV").then(|| "maybe".to_string()));
        assert!(bad.is_err());
    }

    #[test]
    fn geometry_widths() {
        let g = geometry();
        assert_eq!(g.q_hidden(), 512);
        assert_eq!(g.kv_hidden(), 128);
        assert_eq!(g.qkv_hidden(), 768);
        assert_eq!(g.group_size(), 4);
    }
}
