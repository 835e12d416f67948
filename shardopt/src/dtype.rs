//! Data types for buffer elements

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Element types a grad/param buffer may be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// Raw bytes. Used as the param dtype of fp8 buffers.
    U8,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::U8 => 1,
        }
    }

    /// Convert from a safetensors dtype
    #[must_use]
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        match dtype {
            safetensors::Dtype::F32 => Some(Self::F32),
            safetensors::Dtype::F16 => Some(Self::F16),
            safetensors::Dtype::BF16 => Some(Self::BF16),
            safetensors::Dtype::U8 => Some(Self::U8),
            _ => None,
        }
    }

    /// The matching safetensors dtype.
    #[must_use]
    pub fn to_safetensors(self) -> safetensors::Dtype {
        match self {
            Self::F32 => safetensors::Dtype::F32,
            Self::F16 => safetensors::Dtype::F16,
            Self::BF16 => safetensors::Dtype::BF16,
            Self::U8 => safetensors::Dtype::U8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::U8 => write!(f, "u8"),
        }
    }
}

/// Key identifying a dtype-homogeneous grad buffer: `(param dtype, grad dtype)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DtypePair {
    pub param: DType,
    pub grad: DType,
}

impl DtypePair {
    #[must_use]
    pub const fn new(param: DType, grad: DType) -> Self {
        Self { param, grad }
    }

    /// Whether this key marks a buffer that was already split out as fp8.
    #[must_use]
    pub fn is_fp8_sentinel(&self) -> bool {
        self.param == DType::U8
    }
}

impl fmt::Display for DtypePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.param, self.grad)
    }
}

/// The closed set of parameter types the optimizer can shard.
///
/// Fixed at shard construction time; every consumer matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardDtype {
    Half,
    BFloat16,
    Float32,
}

impl ShardDtype {
    /// Whether the optimizer needs a separate full-precision main copy.
    #[must_use]
    pub const fn needs_main_copy(self) -> bool {
        match self {
            Self::Half | Self::BFloat16 => true,
            Self::Float32 => false,
        }
    }
}

impl TryFrom<DType> for ShardDtype {
    type Error = Error;

    fn try_from(dtype: DType) -> Result<Self> {
        match dtype {
            DType::F16 => Ok(Self::Half),
            DType::BF16 => Ok(Self::BFloat16),
            DType::F32 => Ok(Self::Float32),
            DType::U8 => Err(Error::UnsupportedDtype(format!(
                "wrapped parameters must be f32, f16 or bf16, received {dtype}"
            ))),
        }
    }
}

impl From<ShardDtype> for DType {
    fn from(dtype: ShardDtype) -> Self {
        match dtype {
            ShardDtype::Half => Self::F16,
            ShardDtype::BFloat16 => Self::BF16,
            ShardDtype::Float32 => Self::F32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_from_safetensors() {
        for dtype in [DType::F32, DType::F16, DType::BF16, DType::U8] {
            assert_eq!(DType::from_safetensors(dtype.to_safetensors()), Some(dtype));
        }
        assert_eq!(DType::from_safetensors(safetensors::Dtype::I64), None);
    }

    #[test]
    fn test_dtype_pair_display() {
        let key = DtypePair::new(DType::BF16, DType::F32);
        assert_eq!(key.to_string(), "bf16_f32");
        assert!(!key.is_fp8_sentinel());
        assert!(DtypePair::new(DType::U8, DType::F32).is_fp8_sentinel());
    }

    #[test]
    fn test_shard_dtype_closed_set() {
        assert_eq!(ShardDtype::try_from(DType::F16).unwrap(), ShardDtype::Half);
        assert_eq!(
            ShardDtype::try_from(DType::BF16).unwrap(),
            ShardDtype::BFloat16
        );
        assert!(!ShardDtype::Float32.needs_main_copy());
        assert!(ShardDtype::Half.needs_main_copy());

        let err = ShardDtype::try_from(DType::U8).unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype(ref m) if m.contains("u8")));
    }
}
