//! Checkpoint encodings of the sharded optimizer state.
//!
//! Three encodings persist the same per-shard tensors (`param`, `exp_avg`,
//! `exp_avg_sq`):
//!
//! - [`ShardingType::DpZeroGatherScatter`]: gathered onto the root rank as
//!   one unpadded world tensor per buffer and key.
//! - [`ShardingType::FullyShardedBucketSpace`]: every rank writes its own
//!   shard as padded blocks, with no communication.
//! - [`ShardingType::FullyShardedModelSpace`]: every owned slice keyed by
//!   param identity plus a flattened range, portable across topologies.
//!
//! All three go through the [`ParamStateCodec`] interface, selected by tag
//! with [`codec_for`].

pub mod bucket_space;
pub mod dp_zero;
pub mod file;
pub mod model_space;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::optimizer::DistributedOptimizer;
use crate::range::Range;
use crate::{Error, Result};

pub use bucket_space::{BucketLayout, BucketSpaceCodec, BucketSpaceState, StateBlock};
pub use dp_zero::{
    update_legacy_world_tensors, DpZeroBuffer, DpZeroCodec, DpZeroState, LegacyDpZeroBuffer,
    LegacyDpZeroState,
};
pub use model_space::{
    ModelSpaceCodec, ModelSpaceEntry, ModelSpaceState, ReplicaId, ShardedTensorMetadata,
    ShardingMetadata,
};

/// Tag naming a param-state encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardingType {
    DpZeroGatherScatter,
    FullyShardedBucketSpace,
    #[default]
    FullyShardedModelSpace,
}

impl ShardingType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DpZeroGatherScatter => "dp_zero_gather_scatter",
            Self::FullyShardedBucketSpace => "fully_sharded_bucket_space",
            Self::FullyShardedModelSpace => "fully_sharded_model_space",
        }
    }
}

impl FromStr for ShardingType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dp_zero_gather_scatter" => Ok(Self::DpZeroGatherScatter),
            "fully_sharded_bucket_space" => Ok(Self::FullyShardedBucketSpace),
            "fully_sharded_model_space" => Ok(Self::FullyShardedModelSpace),
            other => Err(Error::UnknownEncoding(other.to_string())),
        }
    }
}

impl fmt::Display for ShardingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encoded param state, one variant per encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamState {
    /// `None` on every rank but the root.
    DpZero(Option<DpZeroState>),
    BucketSpace(BucketSpaceState),
    ModelSpace(ModelSpaceState),
}

impl ParamState {
    #[must_use]
    pub fn sharding_type(&self) -> ShardingType {
        match self {
            Self::DpZero(_) => ShardingType::DpZeroGatherScatter,
            Self::BucketSpace(_) => ShardingType::FullyShardedBucketSpace,
            Self::ModelSpace(_) => ShardingType::FullyShardedModelSpace,
        }
    }
}

/// Save/restore protocol of one encoding.
///
/// `encode` and `decode` are collective for encodings that communicate:
/// every rank of the group must call them together.
pub trait ParamStateCodec {
    fn sharding_type(&self) -> ShardingType;

    /// Capture the optimizer's owned shards.
    fn encode(&self, optimizer: &DistributedOptimizer, comm: &dyn Communicator) -> Result<ParamState>;

    /// Overwrite the optimizer's owned shards from `state`.
    fn decode(
        &self,
        optimizer: &mut DistributedOptimizer,
        state: ParamState,
        comm: &dyn Communicator,
    ) -> Result<()>;
}

/// The codec for `sharding_type`.
///
/// Model-space checkpoints need a metadata provider; asking for that codec
/// without one is a [`Error::MissingMetadata`].
pub fn codec_for<'a>(
    sharding_type: ShardingType,
    metadata: Option<&'a dyn ShardingMetadata>,
) -> Result<Box<dyn ParamStateCodec + 'a>> {
    let codec: Box<dyn ParamStateCodec + 'a> = match sharding_type {
        ShardingType::DpZeroGatherScatter => Box::new(DpZeroCodec),
        ShardingType::FullyShardedBucketSpace => Box::new(BucketSpaceCodec),
        ShardingType::FullyShardedModelSpace => {
            let metadata = metadata.ok_or_else(|| {
                Error::MissingMetadata(
                    "fully_sharded_model_space requires a sharding metadata provider".to_string(),
                )
            })?;
            Box::new(ModelSpaceCodec::new(metadata))
        }
    };
    Ok(codec)
}

/// Reject a state whose variant does not belong to `expected`.
pub(crate) fn mismatched_state(expected: ShardingType, state: &ParamState) -> Error {
    Error::UnknownEncoding(format!(
        "{expected} codec given {} state",
        state.sharding_type()
    ))
}

/// The elements of `src` at `range`.
pub(crate) fn read_range(src: &[f32], range: Range) -> Result<&[f32]> {
    src.get(range.as_std())
        .ok_or_else(|| Error::size_mismatch(format!("read of {range}"), range.end, src.len()))
}

/// Copy `values` into `dst` at `range`.
pub(crate) fn write_range(dst: &mut [f32], range: Range, values: &[f32]) -> Result<()> {
    let len = dst.len();
    let slot = dst
        .get_mut(range.as_std())
        .ok_or_else(|| Error::size_mismatch(format!("write to {range}"), range.end, len))?;
    if slot.len() != values.len() {
        return Err(Error::size_mismatch(
            format!("write to {range}"),
            slot.len(),
            values.len(),
        ));
    }
    slot.copy_from_slice(values);
    Ok(())
}
