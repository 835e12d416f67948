//! Per-rank index mapping between the four coordinate frames of a shard.
//!
//! For every param overlapping the local shard of a bucket, a
//! [`ParamRangeMap`] records the same owned elements as:
//!
//! - `global_buffer`: position in the whole grad buffer
//! - `bucket_local`: position in the bucket
//! - `shard_local`: position in this rank's shard
//! - `within_param`: which slice of the param itself is owned
//!
//! All four have the same size.

use std::collections::BTreeMap;

use crate::buffer::{GradBuffer, ParamId};
use crate::dtype::DtypePair;
use crate::partition::BucketPartition;
use crate::range::Range;
use crate::{Error, Result};

/// The owned slice of one param, in all four frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamRangeMap {
    pub global_buffer: Range,
    pub bucket_local: Range,
    pub shard_local: Range,
    pub within_param: Range,
}

impl ParamRangeMap {
    /// Map a param at `param_world` against `shard` (both world coordinates).
    ///
    /// Returns `None` when the param has no element inside the shard.
    #[must_use]
    pub fn compute(param_world: Range, shard: Range, bucket_offset: usize) -> Option<Self> {
        let owned = param_world.intersect(&shard)?;
        let sub_start = shard.start.saturating_sub(param_world.start);
        Some(Self {
            global_buffer: owned,
            bucket_local: Range::new(owned.start - bucket_offset, owned.end - bucket_offset),
            shard_local: Range::new(owned.start - shard.start, owned.end - shard.start),
            within_param: Range::new(sub_start, sub_start + owned.size()),
        })
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.global_buffer.size()
    }
}

/// Locally-owned params of one bucket, in shard-local order.
#[derive(Debug, Clone)]
pub struct BucketRangeMap {
    pub partition: BucketPartition,
    pub params: Vec<(ParamId, ParamRangeMap)>,
}

impl BucketRangeMap {
    #[must_use]
    pub fn bucket_index(&self) -> usize {
        self.partition.bucket_index
    }

    #[must_use]
    pub fn local_numel(&self) -> usize {
        self.partition.local_numel()
    }

    #[must_use]
    pub fn get(&self, id: ParamId) -> Option<&ParamRangeMap> {
        self.params.iter().find(|(p, _)| *p == id).map(|(_, m)| m)
    }
}

/// All bucket maps of one grad buffer for one rank.
#[derive(Debug, Clone)]
pub struct BufferRangeMap {
    pub key: DtypePair,
    pub buckets: Vec<BucketRangeMap>,
}

impl BufferRangeMap {
    pub fn build(buffer: &GradBuffer, world_size: usize, rank: usize) -> Result<Self> {
        let mut buckets = Vec::with_capacity(buffer.buckets().len());
        for bucket in buffer.buckets() {
            let partition = BucketPartition::new(bucket, world_size, rank)?;
            let shard = partition.local();
            let mut params = Vec::new();
            for (id, index) in buffer.param_index_map() {
                if index.bucket != bucket.index {
                    continue;
                }
                let world = index.global;
                if world.start < bucket.offset || world.end > bucket.offset + bucket.size {
                    return Err(Error::Internal(format!(
                        "param {} at {world} spans bucket {} boundary",
                        id.0, bucket.index
                    )));
                }
                if let Some(map) = ParamRangeMap::compute(world, shard, bucket.offset) {
                    params.push((*id, map));
                }
            }
            buckets.push(BucketRangeMap { partition, params });
        }
        Ok(Self {
            key: buffer.dtype(),
            buckets,
        })
    }

    /// Every owned param as `(bucket index, param, map)`, bucket by bucket.
    pub fn owned(&self) -> impl Iterator<Item = (usize, ParamId, &ParamRangeMap)> {
        self.buckets.iter().flat_map(|b| {
            b.params
                .iter()
                .map(move |(id, map)| (b.bucket_index(), *id, map))
        })
    }
}

/// Where an owned param lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamLocation {
    pub buffer: usize,
    pub key: DtypePair,
    pub bucket: usize,
}

/// Reverse map from owned param to its buffer and bucket.
pub fn build_param_locations(maps: &[BufferRangeMap]) -> Result<BTreeMap<ParamId, ParamLocation>> {
    let mut locations = BTreeMap::new();
    for (buffer, map) in maps.iter().enumerate() {
        for (bucket, id, _) in map.owned() {
            let location = ParamLocation {
                buffer,
                key: map.key,
                bucket,
            };
            if let Some(prev) = locations.insert(id, location) {
                return Err(Error::Internal(format!(
                    "param {} mapped twice: buffer {} bucket {} and buffer {buffer} bucket {bucket}",
                    id.0, prev.buffer, prev.bucket
                )));
            }
        }
    }
    Ok(locations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferLayout, ModelParam};
    use crate::dtype::DType;
    use crate::partition::shard_ranges;

    #[test]
    fn test_straddling_param_owned_by_last_rank() {
        let shards = shard_ranges(100, 4, 0).unwrap();
        let param = Range::new(90, 110);
        let maps: Vec<_> = shards
            .iter()
            .map(|s| ParamRangeMap::compute(param, *s, 0))
            .collect();
        assert!(maps[..3].iter().all(Option::is_none));

        let owned = maps[3].unwrap();
        assert_eq!(shards[3], Range::new(75, 100));
        assert_eq!(owned.global_buffer, Range::new(90, 100));
        assert_eq!(owned.shard_local, Range::new(15, 25));
        assert_eq!(owned.within_param, Range::new(0, 10));
        assert_eq!(owned.within_param.size(), 10);
    }

    #[test]
    fn test_boundary_split_param_is_adjacent() {
        let shards = shard_ranges(40, 4, 0).unwrap();
        let param = Range::new(6, 18);
        let maps: Vec<_> = shards
            .iter()
            .filter_map(|s| ParamRangeMap::compute(param, *s, 0))
            .collect();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].within_param, Range::new(0, 4));
        assert_eq!(maps[1].within_param, Range::new(4, 12));
        assert_eq!(maps[0].within_param.end, maps[1].within_param.start);
        let covered: usize = maps.iter().map(|m| m.within_param.size()).sum();
        assert_eq!(covered, param.size());
        for m in &maps {
            assert_eq!(m.shard_local.size(), m.within_param.size());
            assert_eq!(m.bucket_local.size(), m.within_param.size());
        }
    }

    #[test]
    fn test_bucket_local_subtracts_offset() {
        let map = ParamRangeMap::compute(Range::new(130, 150), Range::new(125, 150), 100).unwrap();
        assert_eq!(map.bucket_local, Range::new(30, 50));
        assert_eq!(map.shard_local, Range::new(5, 25));
        assert_eq!(map.within_param, Range::new(0, 20));
    }

    #[test]
    fn test_buffer_map_covers_unpadded_elements() {
        let params: Vec<_> = [7, 3, 9, 5]
            .iter()
            .enumerate()
            .map(|(i, &n)| ModelParam::new(i, format!("p{i}"), &[n]))
            .collect();
        let buffer = GradBuffer::build(
            DtypePair::new(DType::F32, DType::F32),
            params,
            BufferLayout::new(3).with_bucket_size(10),
        )
        .unwrap();

        for (b, bucket) in buffer.buckets().iter().enumerate() {
            let mut owned = 0;
            for rank in 0..3 {
                let map = BufferRangeMap::build(&buffer, 3, rank).unwrap();
                owned += map.buckets[b]
                    .params
                    .iter()
                    .map(|(_, m)| m.numel())
                    .sum::<usize>();
            }
            assert_eq!(owned, bucket.unpadded_size);
        }
    }

    #[test]
    fn test_param_locations() {
        let params: Vec<_> = (0..4)
            .map(|i| ModelParam::new(i, format!("p{i}"), &[4]))
            .collect();
        let buffer = GradBuffer::build(
            DtypePair::new(DType::F32, DType::F32),
            params,
            BufferLayout::new(2).with_bucket_size(8),
        )
        .unwrap();
        let map = BufferRangeMap::build(&buffer, 2, 0).unwrap();
        let locations = build_param_locations(std::slice::from_ref(&map)).unwrap();
        // Rank 0 owns the first half of each 8-element bucket.
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[&ParamId(3)].bucket, 0);
        assert_eq!(locations[&ParamId(1)].bucket, 1);

        let twice = [map.clone(), map];
        assert!(matches!(
            build_param_locations(&twice),
            Err(Error::Internal(_))
        ));
    }
}
