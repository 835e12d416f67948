//! Coordinator gather/scatter encoding.
//!
//! On save every rank packs its shard of each bucket into one contiguous
//! buffer per state key and gathers it onto the root, which concatenates the
//! shards, drops the bucket's tail padding and appends the rest to a single
//! world tensor per buffer and key. Loading runs the same enumeration in
//! reverse: the root re-pads each bucket's slice at the tail, cuts it into
//! `world_size` chunks and scatters them.
//!
//! Only the root ever holds unsharded state.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::file::{ArchiveReader, ArchiveWriter};
use super::{mismatched_state, read_range, write_range, ParamState, ParamStateCodec, ShardingType};
use crate::buffer::{ModelParam, ParamId};
use crate::comm::Communicator;
use crate::dtype::DtypePair;
use crate::optimizer::DistributedOptimizer;
use crate::range::Range;
use crate::reshard::{merge_state_if_needed, split_state_if_needed};
use crate::state::{StateKey, StateTensors};
use crate::{Error, Result};

/// World tensors of one grad buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct DpZeroBuffer {
    pub key: DtypePair,
    pub numel_unpadded: usize,
    /// Each tensor holds `numel_unpadded` elements, buckets back to back.
    pub tensors: StateTensors,
    /// Declaration indices of the buffer's params, in declaration order.
    pub param_indices: Vec<usize>,
    /// Element counts parallel to `param_indices`.
    pub param_numels: Vec<usize>,
}

/// Root-held state of every buffer, in buffer order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DpZeroState {
    pub buffers: Vec<DpZeroBuffer>,
}

impl DpZeroState {
    /// The entry of live buffer `index`, which must be keyed `key`.
    pub fn buffer(&self, index: usize, key: DtypePair) -> Result<&DpZeroBuffer> {
        let entry = self
            .buffers
            .get(index)
            .ok_or_else(|| Error::MissingMetadata(format!("checkpoint has no state for buffer {index}")))?;
        if entry.key != key {
            return Err(Error::MissingMetadata(format!(
                "checkpoint buffer {index} holds {} state, current run expects {key}",
                entry.key
            )));
        }
        Ok(entry)
    }
}

/// Pre-coalescing layout: one world tensor per bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyDpZeroBuffer {
    pub key: DtypePair,
    pub buckets: Vec<StateTensors>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyDpZeroState {
    pub buffers: Vec<LegacyDpZeroBuffer>,
}

/// What a dp-zero file holds.
#[derive(Debug, Clone, PartialEq)]
pub enum DpZeroFile {
    Coalesced(DpZeroState),
    Legacy(LegacyDpZeroState),
}

/// Codec for [`ShardingType::DpZeroGatherScatter`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DpZeroCodec;

impl ParamStateCodec for DpZeroCodec {
    fn sharding_type(&self) -> ShardingType {
        ShardingType::DpZeroGatherScatter
    }

    fn encode(&self, optimizer: &DistributedOptimizer, comm: &dyn Communicator) -> Result<ParamState> {
        Ok(ParamState::DpZero(gather_world_state(optimizer, comm)?))
    }

    fn decode(
        &self,
        optimizer: &mut DistributedOptimizer,
        state: ParamState,
        comm: &dyn Communicator,
    ) -> Result<()> {
        match state {
            ParamState::DpZero(state) => scatter_world_state(optimizer, state, comm),
            other => Err(mismatched_state(self.sharding_type(), &other)),
        }
    }
}

/// One bucket as the scatter path needs it, detached from the optimizer.
struct BucketPlan {
    size: usize,
    unpadded: usize,
    local_numel: usize,
    params: Vec<(ParamId, Range)>,
}

fn bucket_plans(optimizer: &DistributedOptimizer) -> Vec<(DtypePair, Vec<BucketPlan>)> {
    optimizer
        .buffers()
        .iter()
        .zip(optimizer.range_maps())
        .map(|(buffer, map)| {
            let plans = buffer
                .buckets()
                .iter()
                .zip(&map.buckets)
                .map(|(bucket, bucket_map)| BucketPlan {
                    size: bucket.size,
                    unpadded: bucket.unpadded_size,
                    local_numel: bucket_map.local_numel(),
                    params: bucket_map
                        .params
                        .iter()
                        .map(|(id, m)| (*id, m.shard_local))
                        .collect(),
                })
                .collect();
            (buffer.dtype(), plans)
        })
        .collect()
}

/// Gather every rank's shards into unpadded world tensors on the root.
///
/// Collective. Returns `Some` on the root and `None` elsewhere.
pub fn gather_world_state(
    optimizer: &DistributedOptimizer,
    comm: &dyn Communicator,
) -> Result<Option<DpZeroState>> {
    let root = comm.root();
    let mut buffers = Vec::new();

    for (buffer, map) in optimizer.buffers().iter().zip(optimizer.range_maps()) {
        let numel_unpadded = buffer.numel_unpadded();
        let mut world = comm.is_root().then(|| StateTensors::zeros(numel_unpadded));
        let mut offset = 0;

        for (bucket, bucket_map) in buffer.buckets().iter().zip(&map.buckets) {
            let mut local = StateTensors::zeros(bucket_map.local_numel());
            for (id, m) in &bucket_map.params {
                let shard = optimizer.read_shard(*id)?;
                for key in StateKey::ALL {
                    write_range(local.get_mut(key), m.shard_local, shard.get(key))?;
                }
            }

            for key in StateKey::ALL {
                let gathered = comm.gather(local.get(key), root)?;
                if let (Some(chunks), Some(world)) = (gathered, world.as_mut()) {
                    let concat = chunks.concat();
                    if concat.len() != bucket.size {
                        return Err(Error::size_mismatch(
                            format!("gathered bucket {} of buffer {}", bucket.index, buffer.dtype()),
                            bucket.size,
                            concat.len(),
                        ));
                    }
                    write_range(
                        world.get_mut(key),
                        Range::new(offset, offset + bucket.unpadded_size),
                        &concat[..bucket.unpadded_size],
                    )?;
                }
            }
            offset += bucket.unpadded_size;
        }

        if let Some(tensors) = world {
            buffers.push(DpZeroBuffer {
                key: buffer.dtype(),
                numel_unpadded,
                tensors,
                param_indices: buffer.param_indices(),
                param_numels: buffer.params().iter().map(ModelParam::numel).collect(),
            });
        }
    }

    Ok(comm.is_root().then_some(DpZeroState { buffers }))
}

/// Pad `unpadded` at the tail to `size` and cut it into `world_size` chunks.
fn pad_and_chunk(unpadded: &[f32], size: usize, world_size: usize) -> Result<Vec<Vec<f32>>> {
    if unpadded.len() > size {
        return Err(Error::size_mismatch("unpadded bucket slice", size, unpadded.len()));
    }
    if size % world_size != 0 {
        return Err(Error::size_mismatch(
            "padded bucket",
            size.next_multiple_of(world_size),
            size,
        ));
    }
    let mut padded = unpadded.to_vec();
    padded.resize(size, 0.0);
    let local = size / world_size;
    Ok((0..world_size)
        .map(|r| padded[r * local..(r + 1) * local].to_vec())
        .collect())
}

/// Scatter one bucket's slice of one key and copy it into owned shards.
fn scatter_bucket(
    optimizer: &mut DistributedOptimizer,
    plan: &BucketPlan,
    key: StateKey,
    world_slice: Option<&[f32]>,
    comm: &dyn Communicator,
) -> Result<()> {
    let send = world_slice
        .map(|slice| pad_and_chunk(slice, plan.size, comm.world_size()))
        .transpose()?;
    let recv = comm.scatter(send, comm.root())?;
    if recv.len() != plan.local_numel {
        return Err(Error::size_mismatch("scattered shard", plan.local_numel, recv.len()));
    }
    for (id, shard_local) in &plan.params {
        optimizer.write_shard(*id, key, read_range(&recv, *shard_local)?)?;
    }
    Ok(())
}

/// Scatter root-held world tensors back into every rank's shards.
///
/// Collective. Only the root passes `Some(state)`. Checkpoint buffers are
/// matched to live buffers by position. If the fp8 layout differs between
/// the checkpoint and the current run, the root first splits or merges the
/// checkpoint to match.
pub fn scatter_world_state(
    optimizer: &mut DistributedOptimizer,
    state: Option<DpZeroState>,
    comm: &dyn Communicator,
) -> Result<()> {
    let plans = bucket_plans(optimizer);
    let state = if comm.is_root() {
        let mut state = state
            .ok_or_else(|| Error::MissingMetadata("root rank has no dp-zero state".to_string()))?;
        let outcome = split_state_if_needed(&mut state, optimizer.buffers())?;
        let merged = merge_state_if_needed(&mut state, optimizer.buffers())?;
        debug!(?outcome, merged, "dtype reshard check");
        if state.buffers.len() != optimizer.buffers().len() {
            return Err(Error::size_mismatch(
                "grad buffers (current run vs checkpoint)",
                optimizer.buffers().len(),
                state.buffers.len(),
            ));
        }
        for (index, buffer) in optimizer.buffers().iter().enumerate() {
            let entry = state.buffer(index, buffer.dtype())?;
            if entry.numel_unpadded != buffer.numel_unpadded() {
                return Err(Error::size_mismatch(
                    format!("unpadded elements of buffer {} (current run vs checkpoint)", buffer.dtype()),
                    buffer.numel_unpadded(),
                    entry.numel_unpadded,
                ));
            }
        }
        Some(state)
    } else {
        None
    };

    for (index, (key, buckets)) in plans.iter().enumerate() {
        let world = state.as_ref().map(|s| s.buffer(index, *key)).transpose()?;
        for state_key in StateKey::ALL {
            let mut offset = 0;
            for plan in buckets {
                let slice = world
                    .map(|w| read_range(w.tensors.get(state_key), Range::new(offset, offset + plan.unpadded)))
                    .transpose()?;
                offset += plan.unpadded;
                scatter_bucket(optimizer, plan, state_key, slice, comm)?;
            }
        }
    }
    Ok(())
}

/// Re-bucket per-bucket tensors to `new_numels`, keeping element order.
///
/// Only the totals are checked: data lands in the right place as long as
/// the old and new layouts enumerate params identically.
pub fn update_legacy_world_tensors(old: &[Vec<f32>], new_numels: &[usize]) -> Result<Vec<Vec<f32>>> {
    let old_total: usize = old.iter().map(Vec::len).sum();
    let new_total: usize = new_numels.iter().sum();
    if old_total != new_total {
        return Err(Error::size_mismatch("legacy world tensors", new_total, old_total));
    }
    let unified = old.concat();
    let mut start = 0;
    Ok(new_numels
        .iter()
        .map(|&n| {
            let chunk = unified[start..start + n].to_vec();
            start += n;
            chunk
        })
        .collect())
}

/// Scatter a legacy per-bucket checkpoint, re-bucketed to the live layout.
pub fn scatter_legacy_state(
    optimizer: &mut DistributedOptimizer,
    state: Option<LegacyDpZeroState>,
    comm: &dyn Communicator,
) -> Result<()> {
    let plans = bucket_plans(optimizer);
    let state = if comm.is_root() {
        let state = state.ok_or_else(|| {
            Error::MissingMetadata("root rank has no legacy dp-zero state".to_string())
        })?;
        if state.buffers.len() != plans.len() {
            return Err(Error::size_mismatch(
                "legacy checkpoint buffers",
                plans.len(),
                state.buffers.len(),
            ));
        }
        info!("re-bucketing legacy dp-zero checkpoint");
        Some(state)
    } else {
        None
    };

    for (index, (_, buckets)) in plans.iter().enumerate() {
        let new_numels: Vec<usize> = buckets.iter().map(|p| p.unpadded).collect();
        for state_key in StateKey::ALL {
            let world = state
                .as_ref()
                .map(|s| {
                    let old: Vec<Vec<f32>> = s.buffers[index]
                        .buckets
                        .iter()
                        .map(|t| t.get(state_key).to_vec())
                        .collect();
                    update_legacy_world_tensors(&old, &new_numels)
                })
                .transpose()?;
            for (b, plan) in buckets.iter().enumerate() {
                let slice = world.as_ref().map(|w| w[b].as_slice());
                scatter_bucket(optimizer, plan, state_key, slice, comm)?;
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct BufferLayout {
    key: DtypePair,
    #[serde(default)]
    numel_unpadded: Option<usize>,
    #[serde(default)]
    bucket_numels: Option<Vec<usize>>,
    #[serde(default)]
    param_indices: Vec<usize>,
    #[serde(default)]
    param_numels: Vec<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Layout {
    buckets_coalesced: bool,
    buffers: Vec<BufferLayout>,
}

fn tensor_name(buffer: usize, key: DtypePair, state_key: StateKey) -> String {
    format!("buffer{buffer}.{key}.{state_key}")
}

fn legacy_tensor_name(buffer: usize, key: DtypePair, bucket: usize, state_key: StateKey) -> String {
    format!("buffer{buffer}.{key}.bucket{bucket}.{state_key}")
}

/// Write a coalesced dp-zero state.
pub fn save(path: &Path, state: &DpZeroState) -> Result<()> {
    let layout = Layout {
        buckets_coalesced: true,
        buffers: state
            .buffers
            .iter()
            .map(|b| BufferLayout {
                key: b.key,
                numel_unpadded: Some(b.numel_unpadded),
                bucket_numels: None,
                param_indices: b.param_indices.clone(),
                param_numels: b.param_numels.clone(),
            })
            .collect(),
    };
    let mut writer = ArchiveWriter::new(ShardingType::DpZeroGatherScatter, &layout)?;
    for (index, buffer) in state.buffers.iter().enumerate() {
        for state_key in StateKey::ALL {
            writer.push(tensor_name(index, buffer.key, state_key), buffer.tensors.get(state_key));
        }
    }
    writer.write(path)
}

/// Write a per-bucket legacy state.
pub fn save_legacy(path: &Path, state: &LegacyDpZeroState) -> Result<()> {
    let layout = Layout {
        buckets_coalesced: false,
        buffers: state
            .buffers
            .iter()
            .map(|b| -> Result<BufferLayout> {
                Ok(BufferLayout {
                    key: b.key,
                    numel_unpadded: None,
                    bucket_numels: Some(b.buckets.iter().map(StateTensors::numel).collect::<Result<_>>()?),
                    param_indices: Vec::new(),
                    param_numels: Vec::new(),
                })
            })
            .collect::<Result<_>>()?,
    };
    let mut writer = ArchiveWriter::new(ShardingType::DpZeroGatherScatter, &layout)?;
    for (index, buffer) in state.buffers.iter().enumerate() {
        for (bucket, tensors) in buffer.buckets.iter().enumerate() {
            for state_key in StateKey::ALL {
                writer.push(
                    legacy_tensor_name(index, buffer.key, bucket, state_key),
                    tensors.get(state_key),
                );
            }
        }
    }
    writer.write(path)
}

fn read_tensors(reader: &ArchiveReader, name: impl Fn(StateKey) -> String) -> Result<StateTensors> {
    Ok(StateTensors {
        param: reader.tensor(&name(StateKey::Param))?,
        exp_avg: reader.tensor(&name(StateKey::ExpAvg))?,
        exp_avg_sq: reader.tensor(&name(StateKey::ExpAvgSq))?,
    })
}

/// Decode an opened dp-zero archive.
pub fn read(reader: &ArchiveReader) -> Result<DpZeroFile> {
    if reader.sharding_type() != ShardingType::DpZeroGatherScatter {
        return Err(Error::UnknownEncoding(format!(
            "expected {}, found {}",
            ShardingType::DpZeroGatherScatter,
            reader.sharding_type()
        )));
    }
    let layout: Layout = reader.layout()?;
    if layout.buckets_coalesced {
        let buffers = layout
            .buffers
            .iter()
            .enumerate()
            .map(|(index, b)| -> Result<DpZeroBuffer> {
                let numel_unpadded = b.numel_unpadded.ok_or_else(|| {
                    Error::MissingMetadata(format!("buffer {index} has no numel_unpadded"))
                })?;
                let tensors = read_tensors(reader, |k| tensor_name(index, b.key, k))?;
                let numel = tensors.numel()?;
                if numel != numel_unpadded {
                    return Err(Error::size_mismatch(
                        format!("world tensors of buffer {index}"),
                        numel_unpadded,
                        numel,
                    ));
                }
                if b.param_indices.len() != b.param_numels.len() {
                    return Err(Error::size_mismatch(
                        format!("param numels of buffer {index}"),
                        b.param_indices.len(),
                        b.param_numels.len(),
                    ));
                }
                Ok(DpZeroBuffer {
                    key: b.key,
                    numel_unpadded,
                    tensors,
                    param_indices: b.param_indices.clone(),
                    param_numels: b.param_numels.clone(),
                })
            })
            .collect::<Result<_>>()?;
        Ok(DpZeroFile::Coalesced(DpZeroState { buffers }))
    } else {
        let buffers = layout
            .buffers
            .iter()
            .enumerate()
            .map(|(index, b)| -> Result<LegacyDpZeroBuffer> {
                let count = b.bucket_numels.as_ref().map_or(0, Vec::len);
                let buckets = (0..count)
                    .map(|bucket| read_tensors(reader, |k| legacy_tensor_name(index, b.key, bucket, k)))
                    .collect::<Result<_>>()?;
                Ok(LegacyDpZeroBuffer { key: b.key, buckets })
            })
            .collect::<Result<_>>()?;
        Ok(DpZeroFile::Legacy(LegacyDpZeroState { buffers }))
    }
}

/// Open and decode a dp-zero file.
pub fn load(path: &Path) -> Result<DpZeroFile> {
    read(&ArchiveReader::open(path)?)
}
