//! `SafeTensors` checkpoint archives.
//!
//! Every param-state file is a `.safetensors` file of flat f32 tensors. The
//! header metadata carries two entries: the sharding type tag, and a JSON
//! "layout" document with everything that is not tensor data (dtype keys,
//! bucket sizes, ranges, padding flags).

#![allow(clippy::doc_markdown)]

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use safetensors::tensor::{Dtype, SafeTensors, TensorView};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::checkpoint::{bucket_space, dp_zero, model_space, ParamState, ShardingType};
use crate::dtype::DType;
use crate::{Error, Result};

/// Metadata key holding the sharding type tag.
pub const SHARDING_TYPE_KEY: &str = "sharding_type";
/// Metadata key holding the JSON layout document.
pub const LAYOUT_KEY: &str = "layout";

/// Collects f32 tensors and a layout document, then writes one file.
pub struct ArchiveWriter {
    sharding_type: ShardingType,
    layout: String,
    tensors: Vec<(String, Vec<u8>)>,
}

impl ArchiveWriter {
    pub fn new(sharding_type: ShardingType, layout: &impl Serialize) -> Result<Self> {
        Ok(Self {
            sharding_type,
            layout: serde_json::to_string(layout)?,
            tensors: Vec::new(),
        })
    }

    pub fn push(&mut self, name: impl Into<String>, values: &[f32]) {
        self.tensors
            .push((name.into(), bytemuck::cast_slice::<f32, u8>(values).to_vec()));
    }

    /// # Errors
    /// Returns an error if a tensor name repeats or the file cannot be written
    pub fn write(self, path: &Path) -> Result<()> {
        let mut metadata = HashMap::new();
        metadata.insert(
            SHARDING_TYPE_KEY.to_string(),
            self.sharding_type.as_str().to_string(),
        );
        metadata.insert(LAYOUT_KEY.to_string(), self.layout);

        let mut views = Vec::with_capacity(self.tensors.len());
        let mut seen = std::collections::HashSet::new();
        for (name, bytes) in &self.tensors {
            if !seen.insert(name.as_str()) {
                return Err(Error::Internal(format!("duplicate tensor name {name}")));
            }
            let numel = bytes.len() / DType::F32.size_in_bytes();
            views.push((name.as_str(), TensorView::new(Dtype::F32, vec![numel], bytes)?));
        }
        safetensors::serialize_to_file(views, &Some(metadata), path)?;
        Ok(())
    }
}

#[derive(Clone)]
struct TensorMeta {
    dtype: DType,
    data_start: usize,
    data_len: usize,
}

/// A memory-mapped param-state archive.
pub struct ArchiveReader {
    mmap: Mmap,
    sharding_type: ShardingType,
    layout: String,
    tensors: HashMap<String, TensorMeta>,
}

impl ArchiveReader {
    /// # Errors
    /// Returns an error if the file cannot be opened, is not a valid
    /// SafeTensors file, or carries an unknown sharding type tag
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };

        let (_, header) = SafeTensors::read_metadata(&mmap)?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let sharding_type = metadata
            .get(SHARDING_TYPE_KEY)
            .ok_or_else(|| {
                Error::MissingMetadata(format!(
                    "{} has no {SHARDING_TYPE_KEY} entry",
                    path.as_ref().display()
                ))
            })?
            .parse()?;
        let layout = metadata.get(LAYOUT_KEY).cloned().ok_or_else(|| {
            Error::MissingMetadata(format!(
                "{} has no {LAYOUT_KEY} entry",
                path.as_ref().display()
            ))
        })?;

        let st = SafeTensors::deserialize(&mmap)?;
        let mut tensors = HashMap::new();
        for (name, tensor) in st.tensors() {
            let dtype = DType::from_safetensors(tensor.dtype()).ok_or_else(|| {
                Error::UnsupportedDtype(format!("{:?} in tensor {name}", tensor.dtype()))
            })?;
            let data = tensor.data();
            tensors.insert(
                name,
                TensorMeta {
                    dtype,
                    data_start: data.as_ptr() as usize - mmap.as_ptr() as usize,
                    data_len: data.len(),
                },
            );
        }

        Ok(Self {
            mmap,
            sharding_type,
            layout,
            tensors,
        })
    }

    #[must_use]
    pub fn sharding_type(&self) -> ShardingType {
        self.sharding_type
    }

    /// Deserialize the layout document.
    pub fn layout<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.layout)?)
    }

    /// Copy a tensor out as f32 values.
    pub fn tensor(&self, name: &str) -> Result<Vec<f32>> {
        let meta = self
            .tensors
            .get(name)
            .ok_or_else(|| Error::MissingMetadata(format!("tensor {name} not in archive")))?;
        if meta.dtype != DType::F32 {
            return Err(Error::UnsupportedDtype(format!(
                "tensor {name} is {}, expected f32",
                meta.dtype
            )));
        }
        let bytes = &self.mmap[meta.data_start..meta.data_start + meta.data_len];
        Ok(bytemuck::pod_collect_to_vec::<u8, f32>(bytes))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

/// Write `state` to `path`.
///
/// A non-root dp-zero state (`None`) writes nothing.
pub fn save_param_state(path: impl AsRef<Path>, state: &ParamState) -> Result<()> {
    let path = path.as_ref();
    match state {
        ParamState::DpZero(Some(state)) => dp_zero::save(path, state),
        ParamState::DpZero(None) => Ok(()),
        ParamState::BucketSpace(state) => bucket_space::save(path, state),
        ParamState::ModelSpace(state) => model_space::save(path, state),
    }
}

/// Read whatever param state `path` holds, dispatching on its tag.
pub fn load_param_state(path: impl AsRef<Path>) -> Result<ParamState> {
    let reader = ArchiveReader::open(path)?;
    match reader.sharding_type() {
        ShardingType::DpZeroGatherScatter => match dp_zero::read(&reader)? {
            dp_zero::DpZeroFile::Coalesced(state) => Ok(ParamState::DpZero(Some(state))),
            dp_zero::DpZeroFile::Legacy(_) => Err(Error::Internal(
                "legacy dp-zero files load through load_parameter_state".to_string(),
            )),
        },
        ShardingType::FullyShardedBucketSpace => {
            Ok(ParamState::BucketSpace(bucket_space::read(&reader)?))
        }
        ShardingType::FullyShardedModelSpace => {
            Ok(ParamState::ModelSpace(model_space::read(&reader)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, serde::Deserialize)]
    struct Layout {
        numels: Vec<usize>,
    }

    #[test]
    fn test_archive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.safetensors");

        let layout = Layout { numels: vec![3, 0] };
        let mut writer = ArchiveWriter::new(ShardingType::FullyShardedBucketSpace, &layout).unwrap();
        writer.push("a", &[1.0, -2.0, 3.5]);
        writer.push("empty", &[]);
        writer.write(&path).unwrap();

        let reader = ArchiveReader::open(&path).unwrap();
        assert_eq!(reader.sharding_type(), ShardingType::FullyShardedBucketSpace);
        assert_eq!(reader.layout::<Layout>().unwrap(), layout);
        assert_eq!(reader.tensor("a").unwrap(), vec![1.0, -2.0, 3.5]);
        assert!(reader.tensor("empty").unwrap().is_empty());
        assert_eq!(reader.len(), 2);
        assert!(matches!(
            reader.tensor("missing"),
            Err(Error::MissingMetadata(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArchiveWriter::new(ShardingType::DpZeroGatherScatter, &()).unwrap();
        writer.push("x", &[1.0]);
        writer.push("x", &[2.0]);
        let err = writer.write(&dir.path().join("dup.safetensors")).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn test_unknown_tag_in_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.safetensors");
        let data = [0u8; 4];
        let view = TensorView::new(Dtype::F32, vec![1], &data).unwrap();
        let mut metadata = HashMap::new();
        metadata.insert(SHARDING_TYPE_KEY.to_string(), "zero_three".to_string());
        metadata.insert(LAYOUT_KEY.to_string(), "null".to_string());
        safetensors::serialize_to_file([("t", view)], &Some(metadata), &path).unwrap();

        assert!(matches!(
            ArchiveReader::open(&path),
            Err(Error::UnknownEncoding(ref t)) if t == "zero_three"
        ));
    }
}
