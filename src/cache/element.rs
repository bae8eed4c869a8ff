//! Element types that can be stored in a KV cache buffer.

use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

/// The storage dtype of cached key/value tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// Full precision FP32.
    F32,
    /// Half precision FP16 (native accelerator format).
    F16,
    /// Brain float BF16.
    Bf16,
}

impl DType {
    /// Bytes per element for this dtype.
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::Bf16 => 2,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::Bf16 => write!(f, "bf16"),
        }
    }
}

/// A scalar type usable as KV cache storage.
///
/// `Pod` lets buffers zero-fill unwritten slots and expose raw bytes for
/// bit-exact comparisons.
pub trait CacheElement:
    bytemuck::Pod + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;

    /// Every integer in `0..=EXACT_INT_RANGE` is representable without rounding.
    const EXACT_INT_RANGE: usize;

    fn from_f32(value: f32) -> Self;

    fn to_f32(self) -> f32;
}

impl CacheElement for f32 {
    const DTYPE: DType = DType::F32;
    const EXACT_INT_RANGE: usize = 1 << 24;

    fn from_f32(value: f32) -> Self {
        value
    }

    fn to_f32(self) -> f32 {
        self
    }
}

impl CacheElement for f16 {
    const DTYPE: DType = DType::F16;
    const EXACT_INT_RANGE: usize = 1 << 11;

    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

impl CacheElement for bf16 {
    const DTYPE: DType = DType::Bf16;
    const EXACT_INT_RANGE: usize = 1 << 8;

    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }

    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
}
