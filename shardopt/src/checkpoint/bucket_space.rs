//! Fully sharded bucket-space encoding.
//!
//! Every rank writes only its own shard of every bucket, as an ordered list
//! of blocks addressed by shard-local range. Gaps between owned params and
//! the tail of the shard are filled with zeroed padding blocks so the blocks
//! of a bucket always tile `[0, local_numel)` exactly.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::file::{ArchiveReader, ArchiveWriter};
use super::{mismatched_state, ParamState, ParamStateCodec, ShardingType};
use crate::comm::Communicator;
use crate::dtype::DtypePair;
use crate::optimizer::DistributedOptimizer;
use crate::range::Range;
use crate::state::{StateKey, StateTensors};
use crate::{Error, Result};

/// Bucket sizes of one buffer, padded and unpadded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLayout {
    pub key: DtypePair,
    pub numel: Vec<usize>,
    pub numel_unpadded: Vec<usize>,
}

/// A contiguous slice of a rank's shard.
#[derive(Debug, Clone, PartialEq)]
pub struct StateBlock {
    /// Position in the shard.
    pub local: Range,
    pub padding: bool,
    pub tensors: StateTensors,
}

impl StateBlock {
    #[must_use]
    pub fn padding(local: Range) -> Self {
        Self {
            local,
            padding: true,
            tensors: StateTensors::zeros(local.size()),
        }
    }
}

/// One rank's shards, `blocks[buffer][bucket]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketSpaceState {
    pub rank: usize,
    pub world_size: usize,
    pub layouts: Vec<BucketLayout>,
    pub blocks: Vec<Vec<Vec<StateBlock>>>,
}

impl BucketSpaceState {
    /// Padding blocks across all buckets.
    #[must_use]
    pub fn padding_count(&self) -> usize {
        self.blocks
            .iter()
            .flatten()
            .flatten()
            .filter(|b| b.padding)
            .count()
    }
}

/// Insert padding so `blocks` (sorted, disjoint) tile `[0, local_numel)`.
///
/// A shard with no real block becomes one padding block over the whole
/// shard.
#[must_use]
pub fn fill_padding(blocks: Vec<StateBlock>, local_numel: usize) -> Vec<StateBlock> {
    let mut filled = Vec::with_capacity(blocks.len() * 2 + 1);
    let mut cursor = 0;
    for block in blocks {
        if block.local.start != cursor {
            filled.push(StateBlock::padding(Range::new(cursor, block.local.start)));
        }
        cursor = block.local.end;
        filled.push(block);
    }
    if cursor != local_numel {
        filled.push(StateBlock::padding(Range::new(cursor, local_numel)));
    }
    filled
}

/// Codec for [`ShardingType::FullyShardedBucketSpace`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BucketSpaceCodec;

fn live_layouts(optimizer: &DistributedOptimizer) -> Vec<BucketLayout> {
    optimizer
        .buffers()
        .iter()
        .map(|b| BucketLayout {
            key: b.dtype(),
            numel: b.buckets().iter().map(|k| k.size).collect(),
            numel_unpadded: b.buckets().iter().map(|k| k.unpadded_size).collect(),
        })
        .collect()
}

impl ParamStateCodec for BucketSpaceCodec {
    fn sharding_type(&self) -> ShardingType {
        ShardingType::FullyShardedBucketSpace
    }

    fn encode(&self, optimizer: &DistributedOptimizer, _comm: &dyn Communicator) -> Result<ParamState> {
        let mut blocks = Vec::with_capacity(optimizer.range_maps().len());
        for map in optimizer.range_maps() {
            let mut buckets = Vec::with_capacity(map.buckets.len());
            for bucket_map in &map.buckets {
                let real = bucket_map
                    .params
                    .iter()
                    .map(|(id, m)| {
                        Ok(StateBlock {
                            local: m.shard_local,
                            padding: false,
                            tensors: optimizer.read_shard(*id)?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                buckets.push(fill_padding(real, bucket_map.local_numel()));
            }
            blocks.push(buckets);
        }
        Ok(ParamState::BucketSpace(BucketSpaceState {
            rank: optimizer.rank(),
            world_size: optimizer.world_size(),
            layouts: live_layouts(optimizer),
            blocks,
        }))
    }

    fn decode(
        &self,
        optimizer: &mut DistributedOptimizer,
        state: ParamState,
        _comm: &dyn Communicator,
    ) -> Result<()> {
        let state = match state {
            ParamState::BucketSpace(state) => state,
            other => return Err(mismatched_state(self.sharding_type(), &other)),
        };

        let live = live_layouts(optimizer);
        if live.len() != state.layouts.len() {
            return Err(Error::size_mismatch("buffers", live.len(), state.layouts.len()));
        }
        for (live, saved) in live.iter().zip(&state.layouts) {
            if live.numel_unpadded != saved.numel_unpadded {
                let expected: usize = live.numel_unpadded.iter().sum();
                return Err(Error::size_mismatch(
                    format!(
                        "per-bucket unpadded numel of buffer {} (current {:?}, checkpoint {:?})",
                        live.key, live.numel_unpadded, saved.numel_unpadded
                    ),
                    expected,
                    saved.numel_unpadded.iter().sum(),
                ));
            }
        }

        let plan: Vec<Vec<Vec<_>>> = optimizer
            .range_maps()
            .iter()
            .map(|map| {
                map.buckets
                    .iter()
                    .map(|b| b.params.iter().map(|(id, m)| (*id, m.shard_local)).collect())
                    .collect()
            })
            .collect();

        for (b, (buckets, saved_buckets)) in plan.iter().zip(state.blocks).enumerate() {
            if buckets.len() != saved_buckets.len() {
                return Err(Error::size_mismatch(
                    format!("buckets of buffer {b}"),
                    buckets.len(),
                    saved_buckets.len(),
                ));
            }
            for (k, (params, blocks)) in buckets.iter().zip(saved_buckets).enumerate() {
                let real: Vec<StateBlock> = blocks.into_iter().filter(|blk| !blk.padding).collect();
                if real.len() != params.len() {
                    return Err(Error::size_mismatch(
                        format!("non-padding blocks in buffer {b} bucket {k}"),
                        params.len(),
                        real.len(),
                    ));
                }
                for ((id, shard_local), block) in params.iter().zip(real) {
                    if block.local != *shard_local {
                        return Err(Error::MissingMetadata(format!(
                            "block {} of buffer {b} bucket {k} does not match param {} at {shard_local}",
                            block.local, id.0
                        )));
                    }
                    for key in StateKey::ALL {
                        optimizer.write_shard(*id, key, block.tensors.get(key))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BlockLayout {
    local: Range,
    padding: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Layout {
    rank: usize,
    world_size: usize,
    buffers: Vec<BucketLayout>,
    blocks: Vec<Vec<Vec<BlockLayout>>>,
}

fn tensor_name(buffer: usize, bucket: usize, block: usize, key: StateKey) -> String {
    format!("buffer{buffer}.bucket{bucket}.block{block}.{key}")
}

/// Write one rank's bucket-space state.
pub fn save(path: &Path, state: &BucketSpaceState) -> Result<()> {
    let layout = Layout {
        rank: state.rank,
        world_size: state.world_size,
        buffers: state.layouts.clone(),
        blocks: state
            .blocks
            .iter()
            .map(|buckets| {
                buckets
                    .iter()
                    .map(|blocks| {
                        blocks
                            .iter()
                            .map(|b| BlockLayout {
                                local: b.local,
                                padding: b.padding,
                            })
                            .collect()
                    })
                    .collect()
            })
            .collect(),
    };
    let mut writer = ArchiveWriter::new(ShardingType::FullyShardedBucketSpace, &layout)?;
    for (b, buckets) in state.blocks.iter().enumerate() {
        for (k, blocks) in buckets.iter().enumerate() {
            for (i, block) in blocks.iter().enumerate() {
                for key in StateKey::ALL {
                    writer.push(tensor_name(b, k, i, key), block.tensors.get(key));
                }
            }
        }
    }
    writer.write(path)
}

/// Decode an opened bucket-space archive.
pub fn read(reader: &ArchiveReader) -> Result<BucketSpaceState> {
    if reader.sharding_type() != ShardingType::FullyShardedBucketSpace {
        return Err(Error::UnknownEncoding(format!(
            "expected {}, found {}",
            ShardingType::FullyShardedBucketSpace,
            reader.sharding_type()
        )));
    }
    let layout: Layout = reader.layout()?;
    let mut blocks = Vec::with_capacity(layout.blocks.len());
    for (b, buckets) in layout.blocks.iter().enumerate() {
        let mut out_buckets = Vec::with_capacity(buckets.len());
        for (k, metas) in buckets.iter().enumerate() {
            let mut out = Vec::with_capacity(metas.len());
            for (i, meta) in metas.iter().enumerate() {
                let tensors = StateTensors {
                    param: reader.tensor(&tensor_name(b, k, i, StateKey::Param))?,
                    exp_avg: reader.tensor(&tensor_name(b, k, i, StateKey::ExpAvg))?,
                    exp_avg_sq: reader.tensor(&tensor_name(b, k, i, StateKey::ExpAvgSq))?,
                };
                let numel = tensors.numel()?;
                if numel != meta.local.size() {
                    return Err(Error::size_mismatch(
                        format!("block {i} of buffer {b} bucket {k}"),
                        meta.local.size(),
                        numel,
                    ));
                }
                out.push(StateBlock {
                    local: meta.local,
                    padding: meta.padding,
                    tensors,
                });
            }
            out_buckets.push(out);
        }
        blocks.push(out_buckets);
    }
    Ok(BucketSpaceState {
        rank: layout.rank,
        world_size: layout.world_size,
        layouts: layout.buffers,
        blocks,
    })
}

/// Open and decode a bucket-space file.
pub fn load(path: &Path) -> Result<BucketSpaceState> {
    read(&ArchiveReader::open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn real(start: usize, end: usize, fill: f32) -> StateBlock {
        let n = end - start;
        StateBlock {
            local: Range::new(start, end),
            padding: false,
            tensors: StateTensors {
                param: vec![fill; n],
                exp_avg: vec![fill + 0.5; n],
                exp_avg_sq: vec![fill + 0.25; n],
            },
        }
    }

    #[test]
    fn test_fill_padding_gaps_and_tail() {
        let blocks = vec![real(0, 3, 1.0), real(5, 6, 2.0), real(6, 8, 3.0)];
        let filled = fill_padding(blocks, 10);
        let ranges: Vec<_> = filled.iter().map(|b| (b.local, b.padding)).collect();
        assert_eq!(
            ranges,
            vec![
                (Range::new(0, 3), false),
                (Range::new(3, 5), true),
                (Range::new(5, 6), false),
                (Range::new(6, 8), false),
                (Range::new(8, 10), true),
            ]
        );
        assert!(filled[1].tensors.param.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_fill_padding_empty_shard() {
        let filled = fill_padding(Vec::new(), 4);
        assert_eq!(filled.len(), 1);
        assert!(filled[0].padding);
        assert_eq!(filled[0].local, Range::new(0, 4));
        assert!(fill_padding(Vec::new(), 0).is_empty());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rank0.safetensors");
        let state = BucketSpaceState {
            rank: 0,
            world_size: 2,
            layouts: vec![BucketLayout {
                key: DtypePair::new(DType::F32, DType::F32),
                numel: vec![12],
                numel_unpadded: vec![11],
            }],
            blocks: vec![vec![fill_padding(vec![real(1, 4, 7.0)], 6)]],
        };
        assert_eq!(state.padding_count(), 2);
        save(&path, &state).unwrap();
        assert_eq!(load(&path).unwrap(), state);
    }
}
