//! Flat host storage and aliasing shard views over it.
//!
//! A grad buffer owns one [`Storage`] for its params and one for its grads.
//! Everything else in the crate (model params, reduced-precision shards, the
//! fp32 operand of fp32 params) addresses that memory through a
//! [`ShardView`]: a shared handle plus an element [`Range`]. Views are cheap
//! to clone and writes through one view are visible through every other view
//! that overlaps it.
//!
//! Overlap is never checked here. The partitioner hands out disjoint ranges,
//! and that is what keeps concurrent writers apart.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::dtype::DType;
use crate::range::Range;
use crate::{Error, Result};

/// Decode `bytes` (little-endian, `dtype` encoded) into f32 values.
pub fn decode_elements(dtype: DType, bytes: &[u8]) -> Result<Vec<f32>> {
    let out = match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        DType::U8 => {
            return Err(Error::UnsupportedDtype(
                "cannot decode u8 storage as floating point".to_string(),
            ))
        }
    };
    Ok(out)
}

/// Encode `values` into `out` using `dtype`'s little-endian layout.
pub fn encode_elements(dtype: DType, values: &[f32], out: &mut [u8]) -> Result<()> {
    let needed = values.len() * dtype.size_in_bytes();
    if out.len() != needed {
        return Err(Error::size_mismatch("encode_elements bytes", needed, out.len()));
    }
    match dtype {
        DType::F32 => {
            for (c, v) in out.chunks_exact_mut(4).zip(values) {
                c.copy_from_slice(&v.to_le_bytes());
            }
        }
        DType::F16 => {
            for (c, v) in out.chunks_exact_mut(2).zip(values) {
                c.copy_from_slice(&half::f16::from_f32(*v).to_le_bytes());
            }
        }
        DType::BF16 => {
            for (c, v) in out.chunks_exact_mut(2).zip(values) {
                c.copy_from_slice(&half::bf16::from_f32(*v).to_le_bytes());
            }
        }
        DType::U8 => {
            return Err(Error::UnsupportedDtype(
                "cannot encode floating point values into u8 storage".to_string(),
            ))
        }
    }
    Ok(())
}

/// Shared, dtype-tagged flat storage.
#[derive(Clone)]
pub struct Storage {
    bytes: Arc<RwLock<Vec<u8>>>,
    dtype: DType,
    numel: usize,
}

impl Storage {
    /// Allocate zero-filled storage of `numel` elements.
    #[must_use]
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0u8; numel * dtype.size_in_bytes()])),
            dtype,
            numel,
        }
    }

    /// Allocate storage holding `values` converted to `dtype`.
    pub fn from_f32(dtype: DType, values: &[f32]) -> Result<Self> {
        let storage = Self::zeros(dtype, values.len());
        storage.full_view().copy_from_f32(values)?;
        Ok(storage)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// A view of the whole storage.
    #[must_use]
    pub fn full_view(&self) -> ShardView {
        ShardView {
            storage: self.clone(),
            range: Range::new(0, self.numel),
        }
    }

    /// A view of `range` (in element indices).
    pub fn view(&self, range: Range) -> Result<ShardView> {
        if range.end > self.numel {
            return Err(Error::size_mismatch(
                format!("view {range} of storage"),
                self.numel,
                range.end,
            ));
        }
        Ok(ShardView {
            storage: self.clone(),
            range,
        })
    }

    /// Zero every element.
    pub fn zero_(&self) {
        let mut bytes = self.bytes.write().unwrap_or_else(PoisonError::into_inner);
        bytes.fill(0);
    }

    /// Whether both handles point at the same allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("dtype", &self.dtype)
            .field("numel", &self.numel)
            .finish_non_exhaustive()
    }
}

/// A read/write window onto a contiguous element range of a [`Storage`].
#[derive(Clone, Debug)]
pub struct ShardView {
    storage: Storage,
    range: Range,
}

impl ShardView {
    #[must_use]
    pub fn numel(&self) -> usize {
        self.range.size()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.storage.dtype
    }

    /// Position of this view inside its storage.
    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Narrow to `local`, given relative to this view's start.
    pub fn sub_view(&self, local: Range) -> Result<Self> {
        if local.end > self.numel() {
            return Err(Error::size_mismatch(
                format!("sub-view {local} of view {}", self.range),
                self.numel(),
                local.end,
            ));
        }
        Ok(Self {
            storage: self.storage.clone(),
            range: Range::new(self.range.start + local.start, self.range.start + local.end),
        })
    }

    fn byte_range(&self) -> std::ops::Range<usize> {
        let elem = self.dtype().size_in_bytes();
        self.range.start * elem..self.range.end * elem
    }

    /// Copy the viewed elements out, upcast to f32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let bytes = self
            .storage
            .bytes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        decode_elements(self.dtype(), &bytes[self.byte_range()])
    }

    /// Overwrite the viewed elements with `values`, downcasting as needed.
    pub fn copy_from_f32(&self, values: &[f32]) -> Result<()> {
        if values.len() != self.numel() {
            return Err(Error::size_mismatch(
                format!("copy into view {}", self.range),
                self.numel(),
                values.len(),
            ));
        }
        let byte_range = self.byte_range();
        let mut bytes = self
            .storage
            .bytes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        encode_elements(self.dtype(), values, &mut bytes[byte_range])
    }

    /// Copy from another view of equal length (any float dtype).
    pub fn copy_from(&self, src: &ShardView) -> Result<()> {
        let values = src.to_f32_vec()?;
        self.copy_from_f32(&values)
    }

    /// Whether `other` aliases the same allocation.
    #[must_use]
    pub fn shares_storage(&self, other: &ShardView) -> bool {
        self.storage.ptr_eq(&other.storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_aliases_storage() {
        let storage = Storage::zeros(DType::F32, 8);
        let a = storage.view(Range::new(2, 6)).unwrap();
        let b = storage.view(Range::new(4, 8)).unwrap();
        a.copy_from_f32(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(b.to_f32_vec().unwrap(), vec![3.0, 4.0, 0.0, 0.0]);
        assert!(a.shares_storage(&b));
    }

    #[test]
    fn test_sub_view_is_relative() {
        let storage = Storage::from_f32(DType::F32, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let view = storage.view(Range::new(1, 5)).unwrap();
        let sub = view.sub_view(Range::new(1, 3)).unwrap();
        assert_eq!(sub.range(), Range::new(2, 4));
        assert_eq!(sub.to_f32_vec().unwrap(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_out_of_bounds_view() {
        let storage = Storage::zeros(DType::BF16, 4);
        assert!(matches!(
            storage.view(Range::new(0, 5)),
            Err(Error::SizeMismatch { .. })
        ));
        let view = storage.full_view();
        assert!(view.sub_view(Range::new(3, 6)).is_err());
    }

    #[test]
    fn test_reduced_precision_round_trip() {
        let values = [1.0f32, -2.5, 0.125, 1024.0];
        for dtype in [DType::F16, DType::BF16] {
            let storage = Storage::from_f32(dtype, &values).unwrap();
            assert_eq!(storage.full_view().to_f32_vec().unwrap(), values.to_vec());
        }
    }

    #[test]
    fn test_copy_length_mismatch() {
        let storage = Storage::zeros(DType::F32, 3);
        let err = storage.full_view().copy_from_f32(&[1.0]).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch {
                expected: 3,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_u8_storage_is_opaque() {
        let storage = Storage::zeros(DType::U8, 4);
        assert!(matches!(
            storage.full_view().to_f32_vec(),
            Err(Error::UnsupportedDtype(_))
        ));
    }
}
