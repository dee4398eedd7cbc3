//! Element-type policy for the preparation kernels.
//!
//! Working tensors and the cache live in `f16`/`bf16`/`f32` ("storage").
//! Rotary rotation, quantization scaling and softmax run in `f32`
//! ("compute"), and softmax row statistics are always `f32` ("reduction").

use candle_core::{DType, Tensor};

use super::errors::{AttentionError, Result};

/// Tolerances matching each stage's dtype.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    pub storage: f32,
    pub compute: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Policy for tensors stored as `storage`, rejecting dtypes the kernels
    /// are not instantiated for.
    pub fn for_storage(storage: DType) -> Result<Self> {
        match storage {
            DType::F32 | DType::F16 | DType::BF16 => Ok(Self {
                storage,
                compute: DType::F32,
                reduction: DType::F32,
            }),
            other => Err(AttentionError::UnsupportedDType {
                requested: format!("{other:?} (expected f32, f16 or bf16)"),
            }),
        }
    }

    /// Policy derived from an input tensor.
    pub fn of(tensor: &Tensor) -> Result<Self> {
        Self::for_storage(tensor.dtype())
    }

    pub fn storage(&self) -> DType {
        self.storage
    }

    pub fn compute(&self) -> DType {
        self.compute
    }

    pub fn reduction(&self) -> DType {
        self.reduction
    }

    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.compute
    }

    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            compute: epsilon_for(self.compute),
        }
    }

    pub fn cast_for_compute(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    pub fn cast_to_storage(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

pub(crate) fn cast_tensor(tensor: &Tensor, dtype: DType) -> candle_core::Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        _ => 0.0,
    }
}
