//! Even, contiguous partitioning of buckets across data-parallel ranks.

use crate::buffer::Bucket;
use crate::range::Range;
use crate::{Error, Result};

/// Split a bucket of `bucket_size` elements starting at `bucket_offset` into
/// `world_size` equal shards, returning every rank's range in world
/// (full-buffer) coordinates.
///
/// The bucket must already be padded to a multiple of `world_size`.
pub fn shard_ranges(bucket_size: usize, world_size: usize, bucket_offset: usize) -> Result<Vec<Range>> {
    if world_size == 0 {
        return Err(Error::Internal("world size must be positive".to_string()));
    }
    if bucket_size % world_size != 0 {
        return Err(Error::size_mismatch(
            format!("bucket size {bucket_size} not divisible by world size {world_size}"),
            bucket_size.next_multiple_of(world_size),
            bucket_size,
        ));
    }
    let max_shard = bucket_size / world_size;
    Ok((0..world_size)
        .map(|r| {
            let start = r * max_shard;
            let end = bucket_size.min(start + max_shard);
            Range::new(bucket_offset + start, bucket_offset + end)
        })
        .collect())
}

/// All ranks' shards of one bucket, plus which one is local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketPartition {
    pub bucket_index: usize,
    pub bucket_offset: usize,
    /// One range per rank, in world coordinates.
    pub world_ranges: Vec<Range>,
    pub rank: usize,
}

impl BucketPartition {
    pub fn new(bucket: &Bucket, world_size: usize, rank: usize) -> Result<Self> {
        if rank >= world_size {
            return Err(Error::Internal(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        Ok(Self {
            bucket_index: bucket.index,
            bucket_offset: bucket.offset,
            world_ranges: shard_ranges(bucket.size, world_size, bucket.offset)?,
            rank,
        })
    }

    /// The locally-owned shard in world coordinates.
    #[must_use]
    pub fn local(&self) -> Range {
        self.world_ranges[self.rank]
    }

    /// Elements every rank owns in this bucket.
    #[must_use]
    pub fn local_numel(&self) -> usize {
        self.local().size()
    }

    /// Which rank owns world index `idx`, if it falls inside this bucket.
    #[must_use]
    pub fn owner_of(&self, idx: usize) -> Option<usize> {
        self.world_ranges
            .iter()
            .position(|r| r.start <= idx && idx < r.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_coverage_no_overlap() {
        for world_size in [1, 2, 3, 4, 8] {
            for shard in [0, 1, 5, 25] {
                let size = shard * world_size;
                let offset = 17;
                let ranges = shard_ranges(size, world_size, offset).unwrap();
                assert_eq!(ranges.len(), world_size);
                assert_eq!(ranges[0].start, offset);
                assert_eq!(ranges[world_size - 1].end, offset + size);
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start);
                }
                let total: usize = ranges.iter().map(Range::size).sum();
                assert_eq!(total, size);
            }
        }
    }

    #[test]
    fn test_indivisible_bucket() {
        let err = shard_ranges(10, 4, 0).unwrap_err();
        assert!(matches!(
            err,
            Error::SizeMismatch {
                expected: 12,
                got: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_bucket_partition_local() {
        let bucket = Bucket {
            index: 1,
            offset: 100,
            size: 100,
            unpadded_size: 97,
            params: vec![],
        };
        let part = BucketPartition::new(&bucket, 4, 3).unwrap();
        assert_eq!(part.local(), Range::new(175, 200));
        assert_eq!(part.local_numel(), 25);
        assert_eq!(part.owner_of(124), Some(0));
        assert_eq!(part.owner_of(125), Some(1));
        assert_eq!(part.owner_of(200), None);
        assert!(BucketPartition::new(&bucket, 4, 4).is_err());
    }
}
