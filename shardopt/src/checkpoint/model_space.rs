//! Fully sharded model-space encoding.
//!
//! Each owned slice is keyed by the identity of its model param, as given
//! by an external [`ShardingMetadata`] provider, plus the flattened range of
//! the param it covers. Loading matches params by key and stitches the live
//! sub-range out of whatever fragments overlap it, so the data-parallel
//! world size may differ between save and load.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::file::{ArchiveReader, ArchiveWriter};
use super::{mismatched_state, write_range, ParamState, ParamStateCodec, ShardingType};
use crate::buffer::{ModelParam, ParamId};
use crate::comm::Communicator;
use crate::optimizer::DistributedOptimizer;
use crate::range::Range;
use crate::state::StateKey;
use crate::{Error, Result};

/// Position of a tensor replica in the parallel topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId {
    pub pipeline: usize,
    pub tensor: usize,
    pub data: usize,
}

/// What the model-sharding description knows about one param.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedTensorMetadata {
    pub key: String,
    pub replica_id: ReplicaId,
}

impl ShardedTensorMetadata {
    #[must_use]
    pub fn new(key: impl Into<String>, replica_id: ReplicaId) -> Self {
        Self {
            key: key.into(),
            replica_id,
        }
    }
}

/// Looks up the topology metadata of a model param.
pub trait ShardingMetadata {
    fn lookup(&self, param: &ModelParam) -> Option<ShardedTensorMetadata>;
}

/// Metadata keyed by param name.
impl ShardingMetadata for HashMap<String, ShardedTensorMetadata> {
    fn lookup(&self, param: &ModelParam) -> Option<ShardedTensorMetadata> {
        self.get(&param.name).cloned()
    }
}

fn state_prefix(key: StateKey) -> &'static str {
    match key {
        StateKey::Param => "optimizer.state.fp32_param",
        StateKey::ExpAvg => "optimizer.state.exp_avg",
        StateKey::ExpAvgSq => "optimizer.state.exp_avg_sq",
    }
}

/// Checkpoint key of one state tensor of a param.
#[must_use]
pub fn entry_key(state: StateKey, param_key: &str) -> String {
    format!("{}.{param_key}", state_prefix(state))
}

/// One owned slice of one state tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpaceEntry {
    pub key: String,
    pub param_key: String,
    pub state: StateKey,
    /// Data-parallel coordinate is always zero.
    pub replica_id: ReplicaId,
    pub global_numel: usize,
    /// Covered range of the flattened param.
    pub flattened_range: Range,
    #[serde(skip)]
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelSpaceState {
    pub entries: Vec<ModelSpaceEntry>,
}

impl ModelSpaceState {
    /// Combine the states saved by several ranks.
    #[must_use]
    pub fn merge(states: impl IntoIterator<Item = Self>) -> Self {
        Self {
            entries: states.into_iter().flat_map(|s| s.entries).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index(&self) -> HashMap<&str, Vec<&ModelSpaceEntry>> {
        let mut index: HashMap<&str, Vec<&ModelSpaceEntry>> = HashMap::new();
        for entry in &self.entries {
            index.entry(entry.key.as_str()).or_default().push(entry);
        }
        index
    }
}

/// Assemble `wanted` out of the fragments that overlap it.
pub fn stitch(key: &str, wanted: Range, fragments: &[&ModelSpaceEntry]) -> Result<Vec<f32>> {
    let mut out = vec![0.0; wanted.size()];
    let mut covered = Vec::new();
    for fragment in fragments {
        if fragment.data.len() != fragment.flattened_range.size() {
            return Err(Error::size_mismatch(
                format!("fragment {} of {key}", fragment.flattened_range),
                fragment.flattened_range.size(),
                fragment.data.len(),
            ));
        }
        let Some(overlap) = fragment.flattened_range.intersect(&wanted) else {
            continue;
        };
        let src = &fragment.data[overlap.start - fragment.flattened_range.start
            ..overlap.end - fragment.flattened_range.start];
        write_range(&mut out, overlap.normalize(overlap.start - wanted.start), src)?;
        covered.push(overlap);
    }

    covered.sort_by_key(|r| r.start);
    let mut cursor = wanted.start;
    for r in covered {
        if r.start > cursor {
            break;
        }
        cursor = cursor.max(r.end);
    }
    if cursor < wanted.end {
        return Err(Error::MissingMetadata(format!(
            "{key} has no saved data for {}",
            Range::new(cursor, wanted.end)
        )));
    }
    Ok(out)
}

/// Codec for [`ShardingType::FullyShardedModelSpace`].
pub struct ModelSpaceCodec<'a> {
    metadata: &'a dyn ShardingMetadata,
}

impl<'a> ModelSpaceCodec<'a> {
    #[must_use]
    pub fn new(metadata: &'a dyn ShardingMetadata) -> Self {
        Self { metadata }
    }

    fn lookup(&self, param: &ModelParam) -> Result<ShardedTensorMetadata> {
        self.metadata.lookup(param).ok_or_else(|| {
            Error::MissingMetadata(format!("no sharding metadata for param {}", param.name))
        })
    }
}

impl ParamStateCodec for ModelSpaceCodec<'_> {
    fn sharding_type(&self) -> ShardingType {
        ShardingType::FullyShardedModelSpace
    }

    fn encode(&self, optimizer: &DistributedOptimizer, _comm: &dyn Communicator) -> Result<ParamState> {
        let mut entries = Vec::new();
        for (_, _, id, map) in optimizer.owned() {
            let param = optimizer.param(id)?;
            let meta = self.lookup(param)?;
            let replica_id = ReplicaId {
                data: 0,
                ..meta.replica_id
            };
            let tensors = optimizer.read_shard(id)?;
            for state in StateKey::ALL {
                entries.push(ModelSpaceEntry {
                    key: entry_key(state, &meta.key),
                    param_key: meta.key.clone(),
                    state,
                    replica_id,
                    global_numel: param.numel(),
                    flattened_range: map.within_param,
                    data: tensors.get(state).to_vec(),
                });
            }
        }
        Ok(ParamState::ModelSpace(ModelSpaceState { entries }))
    }

    fn decode(
        &self,
        optimizer: &mut DistributedOptimizer,
        state: ParamState,
        _comm: &dyn Communicator,
    ) -> Result<()> {
        let state = match state {
            ParamState::ModelSpace(state) => state,
            other => return Err(mismatched_state(self.sharding_type(), &other)),
        };
        let index = state.index();

        let plan = optimizer
            .owned()
            .map(|(_, _, id, map)| -> Result<(ParamId, ShardedTensorMetadata, usize, Range)> {
                let param = optimizer.param(id)?;
                Ok((id, self.lookup(param)?, param.numel(), map.within_param))
            })
            .collect::<Result<Vec<_>>>()?;

        for (id, meta, numel, within_param) in plan {
            for key in StateKey::ALL {
                let full_key = entry_key(key, &meta.key);
                let fragments = index.get(full_key.as_str()).ok_or_else(|| {
                    Error::MissingMetadata(format!("checkpoint has no entry {full_key}"))
                })?;
                if let Some(saved) = fragments.iter().find(|f| f.global_numel != numel) {
                    return Err(Error::size_mismatch(
                        format!("global numel of {full_key}"),
                        numel,
                        saved.global_numel,
                    ));
                }
                let values = stitch(&full_key, within_param, fragments)?;
                optimizer.write_shard(id, key, &values)?;
            }
        }
        Ok(())
    }
}

fn tensor_name(entry: &ModelSpaceEntry) -> String {
    format!(
        "{}.{}_{}",
        entry.key, entry.flattened_range.start, entry.flattened_range.end
    )
}

/// Write a model-space state, one tensor per entry.
pub fn save(path: &Path, state: &ModelSpaceState) -> Result<()> {
    let mut writer = ArchiveWriter::new(ShardingType::FullyShardedModelSpace, &state.entries)?;
    for entry in &state.entries {
        writer.push(tensor_name(entry), &entry.data);
    }
    writer.write(path)
}

/// Decode an opened model-space archive.
pub fn read(reader: &ArchiveReader) -> Result<ModelSpaceState> {
    if reader.sharding_type() != ShardingType::FullyShardedModelSpace {
        return Err(Error::UnknownEncoding(format!(
            "expected {}, found {}",
            ShardingType::FullyShardedModelSpace,
            reader.sharding_type()
        )));
    }
    let mut entries: Vec<ModelSpaceEntry> = reader.layout()?;
    for entry in &mut entries {
        entry.data = reader.tensor(&tensor_name(entry))?;
        if entry.data.len() != entry.flattened_range.size() {
            return Err(Error::size_mismatch(
                format!("tensor {}", tensor_name(entry)),
                entry.flattened_range.size(),
                entry.data.len(),
            ));
        }
    }
    Ok(ModelSpaceState { entries })
}

/// Open and decode a model-space file.
pub fn load(path: &Path) -> Result<ModelSpaceState> {
    read(&ArchiveReader::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn fragment(start: usize, end: usize) -> ModelSpaceEntry {
        ModelSpaceEntry {
            key: entry_key(StateKey::ExpAvg, "decoder.weight"),
            param_key: "decoder.weight".to_string(),
            state: StateKey::ExpAvg,
            replica_id: ReplicaId::default(),
            global_numel: 20,
            flattened_range: Range::new(start, end),
            data: (start..end).map(|v| v as f32).collect(),
        }
    }

    #[test]
    fn test_entry_keys() {
        assert_eq!(
            entry_key(StateKey::Param, "layers.0.w"),
            "optimizer.state.fp32_param.layers.0.w"
        );
        assert_eq!(
            entry_key(StateKey::ExpAvgSq, "layers.0.w"),
            "optimizer.state.exp_avg_sq.layers.0.w"
        );
    }

    #[test]
    fn test_stitch_across_fragments() {
        let a = fragment(0, 10);
        let b = fragment(10, 20);
        let got = stitch(&a.key, Range::new(5, 15), &[&b, &a]).unwrap();
        let want: Vec<f32> = (5..15u8).map(f32::from).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn test_stitch_reports_gap() {
        let a = fragment(0, 6);
        let b = fragment(8, 20);
        let err = stitch(&a.key, Range::new(4, 12), &[&a, &b]).unwrap_err();
        assert!(matches!(err, Error::MissingMetadata(_)));
        assert!(stitch(&a.key, Range::new(8, 12), &[&a, &b]).is_ok());
    }

    #[test]
    fn test_hash_map_metadata_lookup() {
        let mut metadata = HashMap::new();
        metadata.insert(
            "w".to_string(),
            ShardedTensorMetadata::new("model.w", ReplicaId { pipeline: 1, tensor: 2, data: 3 }),
        );
        let found = metadata.lookup(&ModelParam::new(0, "w", &[4])).unwrap();
        assert_eq!(found.key, "model.w");
        assert!(metadata.lookup(&ModelParam::new(1, "b", &[4])).is_none());
    }

    #[test]
    fn test_file_round_trip_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let rank0 = ModelSpaceState { entries: vec![fragment(0, 7)] };
        let rank1 = ModelSpaceState { entries: vec![fragment(7, 20)] };
        let p0 = dir.path().join("rank0.safetensors");
        let p1 = dir.path().join("rank1.safetensors");
        save(&p0, &rank0).unwrap();
        save(&p1, &rank1).unwrap();

        let merged = ModelSpaceState::merge([load(&p0).unwrap(), load(&p1).unwrap()]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged, ModelSpaceState::merge([rank0, rank1]));

        let index = merged.index();
        let full = stitch(
            &merged.entries[0].key,
            Range::new(0, 20),
            &index[merged.entries[0].key.as_str()],
        )
        .unwrap();
        assert_eq!(full.len(), 20);
        assert!((full[19] - 19.0).abs() < f32::EPSILON);
    }
}
