//! Contiguous param/grad buffers and their dtype-homogeneous buckets.
//!
//! A [`GradBuffer`] lays every parameter of one dtype pair out in a single
//! flat allocation, in reverse declaration order, and cuts that allocation
//! into buckets. Each bucket is padded at its tail so its size divides evenly
//! by the data-parallel world size.

use serde::{Deserialize, Serialize};

use crate::dtype::{DType, DtypePair};
use crate::range::Range;
use crate::storage::{ShardView, Storage};
use crate::{Error, Result};

/// Stable identity of a model parameter: its declaration index in the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub usize);

/// Auxiliary per-parameter attributes that shards inherit from their param.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamAttrs {
    /// Tied-weight marker (e.g. embedding shared with the output layer).
    pub shared: Option<bool>,
    /// Whether the param is itself split across tensor-parallel ranks.
    pub tensor_model_parallel: bool,
    /// Tensor-parallel partition dimension, when split.
    pub partition_dim: Option<usize>,
    /// Tensor-parallel partition stride.
    pub partition_stride: usize,
}

/// Per-tensor fp8 scaling metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fp8Meta {
    pub scale: f32,
    pub scale_inv: f32,
    pub amax: f32,
}

impl Fp8Meta {
    #[must_use]
    pub fn new(scale: f32, amax: f32) -> Self {
        Self {
            scale,
            scale_inv: 1.0 / scale,
            amax,
        }
    }
}

/// A model parameter as seen by the optimizer.
///
/// The element data lives in the owning [`GradBuffer`]; this struct only
/// carries identity, shape and attributes.
#[derive(Debug, Clone)]
pub struct ModelParam {
    pub id: ParamId,
    pub name: String,
    pub shape: Vec<usize>,
    pub attrs: ParamAttrs,
    /// Optional full-precision values to seed the main copy from. Consumed
    /// (and dropped) when shards are materialized.
    pub high_precision_init: Option<Vec<f32>>,
    pub fp8_meta: Option<Fp8Meta>,
}

impl ModelParam {
    #[must_use]
    pub fn new(id: usize, name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            id: ParamId(id),
            name: name.into(),
            shape: shape.to_vec(),
            attrs: ParamAttrs::default(),
            high_precision_init: None,
            fp8_meta: None,
        }
    }

    #[must_use]
    pub fn with_attrs(mut self, attrs: ParamAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    #[must_use]
    pub fn with_high_precision_init(mut self, values: Vec<f32>) -> Self {
        self.high_precision_init = Some(values);
        self
    }

    #[must_use]
    pub fn with_fp8_meta(mut self, meta: Fp8Meta) -> Self {
        self.fp8_meta = Some(meta);
        self
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// One dtype-homogeneous segment of a grad buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    pub index: usize,
    /// Start of the bucket within the full buffer.
    pub offset: usize,
    /// Padded size; always divisible by the world size.
    pub size: usize,
    /// Elements backed by real parameter data.
    pub unpadded_size: usize,
    /// Params in this bucket, in layout (ascending offset) order.
    pub params: Vec<ParamId>,
}

impl Bucket {
    /// The bucket's range in the full buffer.
    #[must_use]
    pub fn range(&self) -> Range {
        Range::new(self.offset, self.offset + self.size)
    }
}

/// Where a parameter sits in its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamIndex {
    pub global: Range,
    pub bucket: usize,
}

/// How buffers are cut into buckets and padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Data-parallel world size every bucket must divide by.
    pub world_size: usize,
    /// Close a bucket once it holds at least this many elements.
    /// `None` puts everything in one bucket.
    pub bucket_size: Option<usize>,
    /// Pad bucket ends to a multiple of `lcm(world_size, 128, 2^16)`.
    pub pad_for_high_nccl_busbw: bool,
}

impl BufferLayout {
    #[must_use]
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            bucket_size: None,
            pad_for_high_nccl_busbw: false,
        }
    }

    #[must_use]
    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = Some(bucket_size);
        self
    }

    /// Multiple that every bucket end is padded up to.
    #[must_use]
    pub fn pad_multiple(&self) -> usize {
        if self.pad_for_high_nccl_busbw {
            lcm(lcm(self.world_size, 128), 1 << 16)
        } else {
            self.world_size
        }
    }

    fn pad(&self, n: usize) -> usize {
        n.div_ceil(self.pad_multiple()) * self.pad_multiple()
    }
}

fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm(a: usize, b: usize) -> usize {
    a / gcd(a, b) * b
}

/// A contiguous param + grad allocation for one dtype pair.
#[derive(Debug)]
pub struct GradBuffer {
    dtype: DtypePair,
    fp8: bool,
    params: Vec<ModelParam>,
    param_index_map: Vec<(ParamId, ParamIndex)>,
    buckets: Vec<Bucket>,
    param_data: Storage,
    grad_data: Storage,
}

impl GradBuffer {
    /// Lay `params` (in declaration order) out into buckets.
    ///
    /// The last declared param lands at offset 0, matching the order in
    /// which gradients become ready during the backward pass.
    pub fn build(dtype: DtypePair, params: Vec<ModelParam>, layout: BufferLayout) -> Result<Self> {
        if layout.world_size == 0 {
            return Err(Error::Internal("world size must be positive".to_string()));
        }
        if params.is_empty() {
            return Err(Error::Internal(format!("buffer {dtype} has no params")));
        }
        if dtype.param == DType::U8 {
            return Err(Error::UnsupportedDtype(
                "u8 is a checkpoint key, not a buffer param dtype".to_string(),
            ));
        }

        let mut param_index_map = Vec::with_capacity(params.len());
        let mut buckets = Vec::new();
        let mut bucket_start = 0usize;
        let mut cursor = 0usize;
        let mut bucket_params = Vec::new();

        for param in params.iter().rev() {
            let start = cursor;
            cursor += param.numel();
            param_index_map.push((
                param.id,
                ParamIndex {
                    global: Range::new(start, cursor),
                    bucket: buckets.len(),
                },
            ));
            bucket_params.push(param.id);

            if layout
                .bucket_size
                .is_some_and(|size| cursor - bucket_start >= size)
            {
                let padded_end = layout.pad(cursor);
                buckets.push(Bucket {
                    index: buckets.len(),
                    offset: bucket_start,
                    size: padded_end - bucket_start,
                    unpadded_size: cursor - bucket_start,
                    params: std::mem::take(&mut bucket_params),
                });
                bucket_start = padded_end;
                cursor = padded_end;
            }
        }
        if !bucket_params.is_empty() {
            let padded_end = layout.pad(cursor);
            buckets.push(Bucket {
                index: buckets.len(),
                offset: bucket_start,
                size: padded_end - bucket_start,
                unpadded_size: cursor - bucket_start,
                params: bucket_params,
            });
            cursor = padded_end;
        }

        Ok(Self {
            dtype,
            fp8: false,
            params,
            param_index_map,
            buckets,
            param_data: Storage::zeros(dtype.param, cursor),
            grad_data: Storage::zeros(dtype.grad, cursor),
        })
    }

    /// Flag this buffer's params as fp8-stored.
    ///
    /// The buffer keeps its 16-bit storage as the params' dummy dtype, but
    /// its key becomes `(u8, grad)`.
    #[must_use]
    pub fn into_fp8(mut self) -> Self {
        self.fp8 = true;
        self.dtype.param = DType::U8;
        self
    }

    /// The buffer key. For fp8 buffers the param side is [`DType::U8`].
    #[must_use]
    pub fn dtype(&self) -> DtypePair {
        self.dtype
    }

    /// Dtype the params are actually stored and sharded as.
    #[must_use]
    pub fn storage_dtype(&self) -> DtypePair {
        DtypePair::new(self.param_data.dtype(), self.dtype.grad)
    }

    #[must_use]
    pub fn is_fp8(&self) -> bool {
        self.fp8
    }

    #[must_use]
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Params in declaration order.
    #[must_use]
    pub fn params(&self) -> &[ModelParam] {
        &self.params
    }

    #[must_use]
    pub fn param(&self, id: ParamId) -> Option<&ModelParam> {
        self.params.iter().find(|p| p.id == id)
    }

    pub fn param_mut(&mut self, id: ParamId) -> Option<&mut ModelParam> {
        self.params.iter_mut().find(|p| p.id == id)
    }

    /// Params in layout order (ascending offset) with their positions.
    #[must_use]
    pub fn param_index_map(&self) -> &[(ParamId, ParamIndex)] {
        &self.param_index_map
    }

    #[must_use]
    pub fn param_index(&self, id: ParamId) -> Option<ParamIndex> {
        self.param_index_map
            .iter()
            .find(|(p, _)| *p == id)
            .map(|(_, idx)| *idx)
    }

    /// Declaration indices of this buffer's params, in declaration order.
    #[must_use]
    pub fn param_indices(&self) -> Vec<usize> {
        self.params.iter().map(|p| p.id.0).collect()
    }

    /// Padded total size.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.param_data.numel()
    }

    /// Sum of every bucket's unpadded size.
    #[must_use]
    pub fn numel_unpadded(&self) -> usize {
        self.buckets.iter().map(|b| b.unpadded_size).sum()
    }

    #[must_use]
    pub fn param_data(&self) -> &Storage {
        &self.param_data
    }

    #[must_use]
    pub fn grad_data(&self) -> &Storage {
        &self.grad_data
    }

    fn index_of(&self, id: ParamId) -> Result<ParamIndex> {
        self.param_index(id).ok_or_else(|| {
            Error::Internal(format!("param {} is not in buffer {}", id.0, self.dtype))
        })
    }

    /// The whole param, as a view into param storage.
    pub fn param_view(&self, id: ParamId) -> Result<ShardView> {
        self.param_data.view(self.index_of(id)?.global)
    }

    /// The param's gradient, as a view into grad storage.
    pub fn grad_view(&self, id: ParamId) -> Result<ShardView> {
        self.grad_data.view(self.index_of(id)?.global)
    }

    /// Param storage of one bucket.
    pub fn bucket_param_view(&self, bucket: usize) -> Result<ShardView> {
        let bucket = self.buckets.get(bucket).ok_or_else(|| {
            Error::Internal(format!("buffer {} has no bucket {bucket}", self.dtype))
        })?;
        self.param_data.view(bucket.range())
    }

    /// Zero the whole grad allocation.
    pub fn zero_grad(&self) {
        self.grad_data.zero_();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(sizes: &[usize]) -> Vec<ModelParam> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &n)| ModelParam::new(i, format!("p{i}"), &[n]))
            .collect()
    }

    #[test]
    fn test_reverse_layout_single_bucket() {
        let buf = GradBuffer::build(
            DtypePair::new(DType::BF16, DType::F32),
            params(&[3, 5, 2]),
            BufferLayout::new(4),
        )
        .unwrap();

        let map = buf.param_index_map();
        assert_eq!(map[0].0, ParamId(2));
        assert_eq!(map[0].1.global, Range::new(0, 2));
        assert_eq!(map[1].1.global, Range::new(2, 7));
        assert_eq!(map[2].1.global, Range::new(7, 10));

        assert_eq!(buf.buckets().len(), 1);
        let bucket = &buf.buckets()[0];
        assert_eq!(bucket.size, 12);
        assert_eq!(bucket.unpadded_size, 10);
        assert_eq!(buf.numel(), 12);
        assert_eq!(buf.numel_unpadded(), 10);
    }

    #[test]
    fn test_bucket_boundaries_are_padded() {
        let buf = GradBuffer::build(
            DtypePair::new(DType::F32, DType::F32),
            params(&[4, 6, 7]),
            BufferLayout::new(4).with_bucket_size(7),
        )
        .unwrap();

        let buckets = buf.buckets();
        assert_eq!(buckets.len(), 2);
        // p2 (7) closes bucket 0 on its own, padded 7 -> 8.
        assert_eq!(buckets[0].params, vec![ParamId(2)]);
        assert_eq!((buckets[0].offset, buckets[0].size), (0, 8));
        // p1 (6) stays open below 7; p0 (4) closes bucket 1.
        assert_eq!(buckets[1].params, vec![ParamId(1), ParamId(0)]);
        assert_eq!(buckets[1].offset, 8);
        assert_eq!(buckets[1].unpadded_size, 10);
        assert_eq!(buckets[1].size, 12);
        assert_eq!(buf.param_index(ParamId(1)).unwrap().global, Range::new(8, 14));
        for bucket in buckets {
            assert_eq!(bucket.size % 4, 0);
        }
    }

    #[test]
    fn test_param_views_alias_buffer() {
        let buf = GradBuffer::build(
            DtypePair::new(DType::F32, DType::F32),
            params(&[2, 2]),
            BufferLayout::new(1),
        )
        .unwrap();
        buf.param_view(ParamId(0))
            .unwrap()
            .copy_from_f32(&[7.0, 8.0])
            .unwrap();
        assert_eq!(
            buf.param_data().full_view().to_f32_vec().unwrap(),
            vec![0.0, 0.0, 7.0, 8.0]
        );
        assert_eq!(buf.param_indices(), vec![0, 1]);
    }

    #[test]
    fn test_high_nccl_busbw_padding() {
        let mut layout = BufferLayout::new(8);
        layout.pad_for_high_nccl_busbw = true;
        assert_eq!(layout.pad_multiple(), 1 << 16);
        assert_eq!(layout.pad(1), 1 << 16);
    }

    #[test]
    fn test_fp8_buffer_key() {
        let buf = GradBuffer::build(
            DtypePair::new(DType::BF16, DType::F32),
            params(&[2]),
            BufferLayout::new(1),
        )
        .unwrap()
        .into_fp8();
        assert!(buf.is_fp8());
        assert!(buf.dtype().is_fp8_sentinel());
        assert_eq!(buf.storage_dtype(), DtypePair::new(DType::BF16, DType::F32));
    }

    #[test]
    fn test_rejects_u8_params() {
        let err = GradBuffer::build(
            DtypePair::new(DType::U8, DType::F32),
            params(&[1]),
            BufferLayout::new(1),
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnsupportedDtype(_)));
    }
}
