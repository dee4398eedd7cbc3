//! Narrow storage codecs for cached keys/values and quantized outputs.
//!
//! Quantized elements are stored as `u8` codes:
//!
//! * int8: offset-binary, `code = clamp(round(x * scale), -128, 127) + 128`.
//! * fp8: E4M3 bit patterns (sign, 4 exponent bits with bias 7, 3 mantissa
//!   bits; max finite magnitude 448, `0x7f`/`0xff` are NaN).
//!
//! Writers multiply by the orig→quant scale before narrowing; readers decode
//! and multiply by its reciprocal.

use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;

use crate::core::errors::{AttentionError, Result};

/// Element precision of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCacheDataType {
    /// Same dtype as the working tensors.
    #[default]
    Base,
    Int8,
    Fp8,
}

impl KvCacheDataType {
    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::Base)
    }

    /// Storage dtype for a cache holding `base`-typed working tensors.
    pub fn storage_dtype(self, base: DType) -> DType {
        match self {
            Self::Base => base,
            Self::Int8 | Self::Fp8 => DType::U8,
        }
    }
}

impl FromStr for KvCacheDataType {
    type Err = AttentionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" | "none" => Ok(Self::Base),
            "int8" => Ok(Self::Int8),
            "fp8" => Ok(Self::Fp8),
            other => Err(AttentionError::InvalidConfig(format!(
                "unknown kv cache type '{other}' (expected base, int8 or fp8)"
            ))),
        }
    }
}

/// Per-tensor scale pair for a quantized cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KvScales {
    orig_quant: f32,
}

impl KvScales {
    pub fn new(orig_quant: f32) -> Self {
        debug_assert!(orig_quant > 0.0);
        Self { orig_quant }
    }

    /// Identity scales for full-precision caches.
    pub fn identity() -> Self {
        Self { orig_quant: 1.0 }
    }

    /// Scale for int8 storage covering `[-max_abs, max_abs]`.
    pub fn int8_for_range(max_abs: f32) -> Self {
        Self::new(127.0 / max_abs.max(f32::MIN_POSITIVE))
    }

    /// Scale for fp8 storage covering `[-max_abs, max_abs]`.
    pub fn fp8_for_range(max_abs: f32) -> Self {
        Self::new(FP8_MAX / max_abs.max(f32::MIN_POSITIVE))
    }

    pub fn orig_quant(&self) -> f32 {
        self.orig_quant
    }

    pub fn quant_orig(&self) -> f32 {
        1.0 / self.orig_quant
    }
}

pub const FP8_MAX: f32 = 448.0;
const FP8_MIN_NORMAL: f64 = 0.015_625; // 2^-6
const FP8_MAX_CODE: f64 = 126.0;
const FP8_MIN_EXP: i32 = -6;
const FP8_MAX_EXP: i32 = 8;

/// Narrow `x` for storage. Base caches cast to `base_dtype`; quantized caches
/// return `u8` codes.
pub fn quantize(x: &Tensor, cache_type: KvCacheDataType, scales: KvScales, base_dtype: DType) -> Result<Tensor> {
    match cache_type {
        KvCacheDataType::Base => Ok(x.to_dtype(base_dtype)?),
        KvCacheDataType::Int8 => int8_encode(x, scales.orig_quant()),
        KvCacheDataType::Fp8 => fp8_encode(x, scales.orig_quant()),
    }
}

/// Inverse of [`quantize`], producing `out_dtype` values.
pub fn dequantize(
    stored: &Tensor,
    cache_type: KvCacheDataType,
    scales: KvScales,
    out_dtype: DType,
) -> Result<Tensor> {
    let values = match cache_type {
        KvCacheDataType::Base => return Ok(stored.to_dtype(out_dtype)?),
        KvCacheDataType::Int8 => int8_decode(stored, scales.orig_quant())?,
        KvCacheDataType::Fp8 => fp8_decode(stored, scales.orig_quant())?,
    };
    Ok(values.to_dtype(out_dtype)?)
}

/// `round(x * scale)` saturated to int8, stored offset by 128.
pub fn int8_encode(x: &Tensor, scale: f32) -> Result<Tensor> {
    let scaled = x.to_dtype(DType::F32)?.affine(scale as f64, 0.0)?;
    let codes = scaled.round()?.clamp(-128f32, 127f32)?.affine(1.0, 128.0)?;
    Ok(codes.to_dtype(DType::U8)?)
}

/// Decode int8 codes to f32 and undo `scale`.
pub fn int8_decode(codes: &Tensor, scale: f32) -> Result<Tensor> {
    let values = codes.to_dtype(DType::F32)?.affine(1.0, -128.0)?;
    Ok(values.affine(1.0 / scale as f64, 0.0)?)
}

/// Encode `x * scale` as E4M3 with round-to-nearest and saturation.
pub fn fp8_encode(x: &Tensor, scale: f32) -> Result<Tensor> {
    let scaled = x.to_dtype(DType::F32)?.affine(scale as f64, 0.0)?;
    let magnitude = scaled.abs()?.clamp(0f32, FP8_MAX)?;

    let subnormal = magnitude.affine(512.0, 0.0)?.round()?;

    let safe = magnitude.maximum(FP8_MIN_NORMAL)?;
    let log2 = safe.log()?.affine(1.0 / std::f64::consts::LN_2, 0.0)?.floor()?;
    let mut exponent = log2.clamp(FP8_MIN_EXP as f32, FP8_MAX_EXP as f32)?;
    // floor(log2) can land one off at exact powers of two
    let power = exact_pow2(&exponent)?;
    let too_high = safe.lt(&power)?.to_dtype(DType::F32)?;
    let too_low = safe.ge(&power.affine(2.0, 0.0)?)?.to_dtype(DType::F32)?;
    exponent = exponent.sub(&too_high)?.add(&too_low)?;
    let power = exact_pow2(&exponent)?;
    let mantissa = safe.div(&power)?.affine(8.0, -8.0)?.round()?;
    let normal = exponent.affine(8.0, 56.0)?.add(&mantissa)?;

    let is_subnormal = magnitude.lt(FP8_MIN_NORMAL)?;
    let code = is_subnormal
        .where_cond(&subnormal, &normal)?
        .clamp(0f32, FP8_MAX_CODE as f32)?;
    let sign = scaled.lt(0f64)?.to_dtype(DType::F32)?.affine(128.0, 0.0)?;
    Ok(code.add(&sign)?.to_dtype(DType::U8)?)
}

/// `2^e` for integral `e` in `[FP8_MIN_EXP, FP8_MAX_EXP]`, looked up so the
/// result is exact.
fn exact_pow2(exponent: &Tensor) -> Result<Tensor> {
    let table: Vec<f32> = (FP8_MIN_EXP..=FP8_MAX_EXP).map(|e| 2f32.powi(e)).collect();
    let table = Tensor::from_vec(table, ((FP8_MAX_EXP - FP8_MIN_EXP + 1) as usize,), exponent.device())?;
    let shape = exponent.dims().to_vec();
    let index = exponent
        .affine(1.0, -FP8_MIN_EXP as f64)?
        .to_dtype(DType::U32)?
        .flatten_all()?;
    Ok(table.index_select(&index, 0)?.reshape(shape)?)
}

/// Decode E4M3 codes to f32 and undo `scale`.
pub fn fp8_decode(codes: &Tensor, scale: f32) -> Result<Tensor> {
    let lut = fp8_lookup_table(codes.device())?;
    let shape = codes.dims().to_vec();
    let flat = codes.flatten_all()?;
    let values = lut.index_select(&flat, 0)?.reshape(shape)?;
    Ok(values.affine(1.0 / scale as f64, 0.0)?)
}

fn fp8_lookup_table(device: &Device) -> Result<Tensor> {
    let table: Vec<f32> = (0u16..256).map(|code| fp8_to_f32(code as u8)).collect();
    Ok(Tensor::from_vec(table, (256,), device)?)
}

/// Decode one E4M3 bit pattern.
pub fn fp8_to_f32(code: u8) -> f32 {
    let sign = if code & 0x80 != 0 { -1.0 } else { 1.0 };
    let exponent = ((code >> 3) & 0x0f) as i32;
    let mantissa = (code & 0x07) as f32;
    if exponent == 0x0f && mantissa == 7.0 {
        return f32::NAN;
    }
    let magnitude = if exponent == 0 {
        mantissa * 2f32.powi(-9)
    } else {
        (1.0 + mantissa / 8.0) * 2f32.powi(exponent - 7)
    };
    sign * magnitude
}

/// Encode one value as E4M3 (round-to-nearest, saturating).
pub fn f32_to_fp8(value: f32) -> u8 {
    let sign = if value.is_sign_negative() && value != 0.0 { 0x80u8 } else { 0 };
    let magnitude = value.abs().min(FP8_MAX) as f64;
    let code = if magnitude < FP8_MIN_NORMAL {
        (magnitude * 512.0).round()
    } else {
        let mut exponent = magnitude.log2().floor();
        if magnitude < exponent.exp2() {
            exponent -= 1.0;
        } else if magnitude >= (exponent + 1.0).exp2() {
            exponent += 1.0;
        }
        let mantissa = (magnitude / exponent.exp2() * 8.0 - 8.0).round();
        (exponent + 7.0) * 8.0 + mantissa
    };
    code.clamp(0.0, FP8_MAX_CODE) as u8 | sign
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_fp8_matches_known_patterns() {
        assert_eq!(f32_to_fp8(1.0), 0x38);
        assert_eq!(f32_to_fp8(-2.0), 0xc0);
        assert_eq!(f32_to_fp8(448.0), 0x7e);
        assert_eq!(f32_to_fp8(1.0e6), 0x7e);
        assert_eq!(f32_to_fp8(2f32.powi(-9)), 0x01);
        assert_eq!(fp8_to_f32(0x38), 1.0);
        assert_eq!(fp8_to_f32(0x7e), 448.0);
        assert!(fp8_to_f32(0x7f).is_nan());
        for code in 0u8..0x7f {
            assert_eq!(f32_to_fp8(fp8_to_f32(code)), code, "code {code:#x}");
        }
    }

    #[test]
    fn tensor_fp8_matches_host_encoder() -> Result<()> {
        let device = Device::Cpu;
        let values: Vec<f32> = vec![0.0, 1.0, -1.0, 0.3, -0.0021, 3.75, 17.0, 300.0, 1000.0, 0.0625, 1.0625];
        let x = Tensor::from_vec(values.clone(), (values.len(),), &device)?;
        let codes = fp8_encode(&x, 1.0)?.to_vec1::<u8>()?;
        let expected: Vec<u8> = values.iter().map(|&v| f32_to_fp8(v)).collect();
        assert_eq!(codes, expected);
        Ok(())
    }

    #[test]
    fn int8_round_trip_within_half_step() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![-2.0f32, -0.51, 0.0, 0.74, 1.99], (5,), &device)?;
        let scales = KvScales::int8_for_range(2.0);
        let codes = quantize(&x, KvCacheDataType::Int8, scales, DType::F32)?;
        assert_eq!(codes.dtype(), DType::U8);
        let back = dequantize(&codes, KvCacheDataType::Int8, scales, DType::F32)?.to_vec1::<f32>()?;
        for (orig, rest) in x.to_vec1::<f32>()?.iter().zip(&back) {
            assert!((orig - rest).abs() <= 0.5 * scales.quant_orig() + 1e-6);
        }
        Ok(())
    }

    #[test]
    fn int8_saturates_out_of_range() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::from_vec(vec![-10.0f32, 10.0], (2,), &device)?;
        let codes = int8_encode(&x, 127.0)?.to_vec1::<u8>()?;
        assert_eq!(codes, vec![0, 255]);
        Ok(())
    }

    #[test]
    fn parses_cache_type_names() {
        assert_eq!("INT8".parse::<KvCacheDataType>().ok(), Some(KvCacheDataType::Int8));
        assert_eq!("base".parse::<KvCacheDataType>().ok(), Some(KvCacheDataType::Base));
        assert!("int4".parse::<KvCacheDataType>().is_err());
    }
}
