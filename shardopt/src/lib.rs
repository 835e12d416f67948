//! Shardopt: a data-parallel distributed optimizer core
//!
//! Optimizer state is sharded over a data-parallel group by cutting each
//! flat grad buffer bucket into `world_size` equal contiguous pieces. This
//! crate owns the index mapping between the four coordinate frames of an
//! owned param slice, the materialization of the optimizer's shard views,
//! and the three checkpoint encodings of the sharded state (with dtype
//! resharding on load).
//!
//! Collectives are abstracted behind [`Communicator`]; an in-process
//! implementation lives in the `shardopt-local` crate.

pub mod buffer;
#[allow(clippy::doc_markdown)]
pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod dtype;
pub mod error;
pub mod groups;
pub mod materialize;
pub mod optimizer;
pub mod param_map;
pub mod partition;
pub mod range;
pub mod reshard;
pub mod state;
pub mod storage;

pub use buffer::{
    Bucket, BufferLayout, Fp8Meta, GradBuffer, ModelParam, ParamAttrs, ParamId, ParamIndex,
};
pub use checkpoint::file::{load_param_state, save_param_state, ArchiveReader, ArchiveWriter};
pub use checkpoint::{
    codec_for, BucketSpaceState, DpZeroState, ModelSpaceState, ParamState, ParamStateCodec,
    ReplicaId, ShardedTensorMetadata, ShardingMetadata, ShardingType,
};
pub use comm::{Communicator, SoloComm};
pub use config::{GroupConfig, OptimizerConfig};
pub use dtype::{DType, DtypePair, ShardDtype};
pub use error::{Error, Result};
pub use groups::{assemble_groups, GroupAssembly, OptimizerGroupRange, ParamGroup};
pub use materialize::{materialize_shards, ShardGroup, ShardRecord};
pub use optimizer::{DistributedOptimizer, ShardUpdate};
pub use param_map::{BucketRangeMap, BufferRangeMap, ParamLocation, ParamRangeMap};
pub use partition::{shard_ranges, BucketPartition};
pub use range::Range;
pub use reshard::{merge_state_if_needed, split_state_if_needed, SplitOutcome};
pub use state::{AdamState, GradScalerState, OptimizerStateDict, StateKey, StateTensors};
pub use storage::{ShardView, Storage};
