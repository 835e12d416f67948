//! The distributed optimizer: sharded state over data-parallel grad buffers.
//!
//! Construction runs the whole sharding pipeline once (partition, map,
//! assemble, materialize) and allocates zeroed moment estimates for every
//! owned shard. After that the structure is fixed; steps and checkpoint
//! loads only rewrite element data.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::buffer::{GradBuffer, ModelParam, ParamId};
use crate::checkpoint::dp_zero::{self, DpZeroFile};
use crate::checkpoint::{codec_for, ShardingMetadata, ShardingType};
use crate::comm::Communicator;
use crate::config::{GroupConfig, OptimizerConfig};
use crate::groups::{assemble_groups, GroupAssembly, GroupPosition, ParamGroup};
use crate::materialize::{materialize_shards, ShardGroup, ShardRecord};
use crate::param_map::{build_param_locations, BufferRangeMap, ParamLocation, ParamRangeMap};
use crate::state::{AdamState, GradScalerState, OptimizerStateDict, StateKey, StateTensors};
use crate::{Error, Result};

/// The numerical update, applied to one owned shard at a time.
///
/// The sharding engine never looks at the arithmetic; it only hands over
/// the shard's full-precision values, its gradient slice and its moments.
pub trait ShardUpdate {
    fn update(
        &mut self,
        group: &GroupConfig,
        param: &mut [f32],
        grad: &[f32],
        state: &mut AdamState,
    ) -> Result<()>;
}

impl<F> ShardUpdate for F
where
    F: FnMut(&GroupConfig, &mut [f32], &[f32], &mut AdamState) -> Result<()>,
{
    fn update(
        &mut self,
        group: &GroupConfig,
        param: &mut [f32],
        grad: &[f32],
        state: &mut AdamState,
    ) -> Result<()> {
        self(group, param, grad, state)
    }
}

/// Optimizer state sharded across a data-parallel group.
#[derive(Debug)]
pub struct DistributedOptimizer {
    config: OptimizerConfig,
    rank: usize,
    world_size: usize,
    buffers: Vec<GradBuffer>,
    range_maps: Vec<BufferRangeMap>,
    locations: BTreeMap<ParamId, ParamLocation>,
    assembly: GroupAssembly,
    groups: Vec<ShardGroup>,
    /// Parallel to `groups[g].records`.
    state: Vec<Vec<AdamState>>,
    grad_scaler: Option<GradScalerState>,
}

impl DistributedOptimizer {
    /// Shard `buffers` for `rank` of a `world_size`-rank group.
    ///
    /// Every buffer's buckets must already be padded to a multiple of
    /// `world_size`.
    pub fn new(
        config: OptimizerConfig,
        mut buffers: Vec<GradBuffer>,
        param_groups: &[ParamGroup],
        rank: usize,
        world_size: usize,
    ) -> Result<Self> {
        let range_maps = buffers
            .iter()
            .map(|b| BufferRangeMap::build(b, world_size, rank))
            .collect::<Result<Vec<_>>>()?;
        let locations = build_param_locations(&range_maps)?;
        let assembly = assemble_groups(param_groups, &range_maps)?;
        let groups = materialize_shards(&mut buffers, &range_maps, &locations, &assembly)?;
        let state = groups
            .iter()
            .map(|g| g.records.iter().map(|r| AdamState::zeros(r.numel())).collect())
            .collect();

        info!(
            rank,
            world_size,
            buffers = buffers.len(),
            buckets = buffers.iter().map(|b| b.buckets().len()).sum::<usize>(),
            owned_params = locations.len(),
            "built distributed optimizer"
        );

        Ok(Self {
            config,
            rank,
            world_size,
            buffers,
            range_maps,
            locations,
            assembly,
            groups,
            state,
            grad_scaler: None,
        })
    }

    /// Build for the calling rank of `comm`.
    pub fn for_comm(
        config: OptimizerConfig,
        buffers: Vec<GradBuffer>,
        param_groups: &[ParamGroup],
        comm: &dyn Communicator,
    ) -> Result<Self> {
        Self::new(config, buffers, param_groups, comm.rank(), comm.world_size())
    }

    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[must_use]
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    #[must_use]
    pub fn buffers(&self) -> &[GradBuffer] {
        &self.buffers
    }

    #[must_use]
    pub fn range_maps(&self) -> &[BufferRangeMap] {
        &self.range_maps
    }

    #[must_use]
    pub fn shard_groups(&self) -> &[ShardGroup] {
        &self.groups
    }

    #[must_use]
    pub fn group_assembly(&self) -> &GroupAssembly {
        &self.assembly
    }

    #[must_use]
    pub fn grad_scaler(&self) -> Option<&GradScalerState> {
        self.grad_scaler.as_ref()
    }

    pub fn set_grad_scaler(&mut self, state: Option<GradScalerState>) {
        self.grad_scaler = state;
    }

    /// Every owned param as `(buffer, bucket, param, map)`.
    ///
    /// This is the enumeration order positional checkpoints rely on.
    pub fn owned(&self) -> impl Iterator<Item = (usize, usize, ParamId, &ParamRangeMap)> {
        self.range_maps
            .iter()
            .enumerate()
            .flat_map(|(buffer, map)| map.owned().map(move |(bucket, id, m)| (buffer, bucket, id, m)))
    }

    fn position(&self, id: ParamId) -> Result<GroupPosition> {
        self.assembly
            .position(id)
            .ok_or_else(|| Error::Internal(format!("param {} is not owned by rank {}", id.0, self.rank)))
    }

    fn location(&self, id: ParamId) -> Result<ParamLocation> {
        self.locations
            .get(&id)
            .copied()
            .ok_or_else(|| Error::Internal(format!("param {} is not owned by rank {}", id.0, self.rank)))
    }

    /// The model param behind an owned shard.
    pub fn param(&self, id: ParamId) -> Result<&ModelParam> {
        let location = self.location(id)?;
        self.buffers[location.buffer]
            .param(id)
            .ok_or_else(|| Error::Internal(format!("param {} missing from its buffer", id.0)))
    }

    /// The range map of an owned param.
    pub fn range_map(&self, id: ParamId) -> Result<&ParamRangeMap> {
        let location = self.location(id)?;
        self.range_maps[location.buffer].buckets[location.bucket]
            .get(id)
            .ok_or_else(|| Error::Internal(format!("param {} missing from its bucket map", id.0)))
    }

    pub fn shard_record(&self, id: ParamId) -> Result<&ShardRecord> {
        let pos = self.position(id)?;
        Ok(&self.groups[pos.group].records[pos.order])
    }

    pub fn adam_state(&self, id: ParamId) -> Result<&AdamState> {
        let pos = self.position(id)?;
        Ok(&self.state[pos.group][pos.order])
    }

    /// Snapshot of an owned shard's persisted tensors.
    pub fn read_shard(&self, id: ParamId) -> Result<StateTensors> {
        let state = self.adam_state(id)?;
        Ok(StateTensors {
            param: self.shard_record(id)?.main_param().to_f32_vec()?,
            exp_avg: state.exp_avg.clone(),
            exp_avg_sq: state.exp_avg_sq.clone(),
        })
    }

    /// Overwrite one tensor of an owned shard.
    pub fn write_shard(&mut self, id: ParamId, key: StateKey, values: &[f32]) -> Result<()> {
        let pos = self.position(id)?;
        let target = match key {
            StateKey::Param => {
                return self.groups[pos.group].records[pos.order]
                    .main_param()
                    .copy_from_f32(values)
            }
            StateKey::ExpAvg => &mut self.state[pos.group][pos.order].exp_avg,
            StateKey::ExpAvgSq => &mut self.state[pos.group][pos.order].exp_avg_sq,
        };
        if target.len() != values.len() {
            return Err(Error::size_mismatch(
                format!("{key} of param {}", id.0),
                target.len(),
                values.len(),
            ));
        }
        target.copy_from_slice(values);
        Ok(())
    }

    fn copy_model_grads_to_main_grads(&self) -> Result<Vec<Vec<Vec<f32>>>> {
        self.groups
            .iter()
            .map(|group| {
                group
                    .records
                    .iter()
                    .map(|record| {
                        let id = record.param();
                        let location = self.location(id)?;
                        let map = self.range_map(id)?;
                        self.buffers[location.buffer]
                            .grad_view(id)?
                            .sub_view(map.within_param)?
                            .to_f32_vec()
                    })
                    .collect()
            })
            .collect()
    }

    fn copy_main_params_to_model_params(&self) -> Result<()> {
        for group in &self.groups {
            for record in &group.records {
                if let ShardRecord::Reduced { param, main, .. } = record {
                    let location = self.location(*param)?;
                    let map = self.range_map(*param)?;
                    self.buffers[location.buffer]
                        .bucket_param_view(location.bucket)?
                        .sub_view(map.bucket_local)?
                        .copy_from(main)?;
                }
            }
        }
        Ok(())
    }

    /// Reload main copies from the model params (e.g. after finetuning
    /// loads new weights into the model).
    pub fn copy_model_params_to_main_params(&self) -> Result<()> {
        for group in &self.groups {
            for record in &group.records {
                if let ShardRecord::Reduced { model, main, .. } = record {
                    main.copy_from(model)?;
                }
            }
        }
        Ok(())
    }

    /// One optimizer step over every owned shard.
    pub fn step(&mut self, update: &mut impl ShardUpdate, comm: &dyn Communicator) -> Result<()> {
        let main_grads = self.copy_model_grads_to_main_grads()?;
        for ((group, states), grads) in self.groups.iter().zip(&mut self.state).zip(&main_grads) {
            for ((record, state), grad) in group.records.iter().zip(states.iter_mut()).zip(grads) {
                let mut values = record.main_param().to_f32_vec()?;
                update.update(&group.config, &mut values, grad, state)?;
                record.main_param().copy_from_f32(&values)?;
            }
        }
        self.copy_main_params_to_model_params()?;
        self.update_fp8_scale_inv_and_amax(comm)
    }

    /// Zero every grad buffer.
    pub fn zero_grad(&self) {
        for buffer in &self.buffers {
            buffer.zero_grad();
        }
    }

    /// Refresh `scale_inv` of fp8 params and max-reduce their amax values.
    pub fn update_fp8_scale_inv_and_amax(&mut self, comm: &dyn Communicator) -> Result<()> {
        let mut amaxes = Vec::new();
        for buffer in &mut self.buffers {
            let ids: Vec<_> = buffer.params().iter().map(|p| p.id).collect();
            for id in ids {
                if let Some(meta) = buffer.param_mut(id).and_then(|p| p.fp8_meta.as_mut()) {
                    meta.scale_inv = 1.0 / meta.scale;
                    amaxes.push(meta.amax);
                }
            }
        }
        if amaxes.is_empty() {
            return Ok(());
        }
        comm.all_reduce_max(&mut amaxes)?;
        let mut reduced = amaxes.into_iter();
        for buffer in &mut self.buffers {
            let ids: Vec<_> = buffer.params().iter().map(|p| p.id).collect();
            for id in ids {
                if let Some(meta) = buffer.param_mut(id).and_then(|p| p.fp8_meta.as_mut()) {
                    meta.amax = reduced.next().ok_or_else(|| {
                        Error::Comm("all_reduce_max returned fewer amax values".to_string())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Non-parameter state: group configs and grad-scaler state.
    #[must_use]
    pub fn state_dict(&self) -> OptimizerStateDict {
        OptimizerStateDict {
            param_groups: self.groups.iter().map(|g| g.config.clone()).collect(),
            grad_scaler: self.grad_scaler.clone(),
            param_state: None,
            param_state_sharding_type: None,
        }
    }

    /// State dict plus param state encoded as `sharding_type`, or as the
    /// configured sharding type when `None`.
    pub fn sharded_state_dict(
        &self,
        sharding_type: Option<ShardingType>,
        metadata: Option<&dyn ShardingMetadata>,
        comm: &dyn Communicator,
    ) -> Result<OptimizerStateDict> {
        let sharding_type = sharding_type.unwrap_or(self.config.sharding_type);
        if sharding_type == ShardingType::FullyShardedBucketSpace {
            warn!("fully_sharded_bucket_space sharding type is deprecated, prefer fully_sharded_model_space");
        }
        let codec = codec_for(sharding_type, metadata)?;
        let param_state = codec.encode(self, comm)?;
        Ok(self.state_dict().with_param_state(param_state))
    }

    /// Restore from a state dict, dispatching param state to its codec.
    pub fn load_state_dict(
        &mut self,
        state: OptimizerStateDict,
        metadata: Option<&dyn ShardingMetadata>,
        comm: &dyn Communicator,
    ) -> Result<()> {
        if state.param_groups.len() != self.groups.len() {
            return Err(Error::size_mismatch(
                "optimizer param groups",
                self.groups.len(),
                state.param_groups.len(),
            ));
        }
        let sharding_type = state.sharding_type()?;

        match (sharding_type, state.param_state) {
            (Some(sharding_type), Some(param_state)) => {
                info!(rank = self.rank, %sharding_type, "loading param state");
                let codec = codec_for(sharding_type, metadata)?;
                codec.decode(self, param_state, comm)?;
            }
            (None, None) => {}
            (Some(sharding_type), None) => {
                return Err(Error::MissingMetadata(format!(
                    "state dict tagged {sharding_type} carries no param state"
                )))
            }
            (None, Some(param_state)) => {
                return Err(Error::MissingMetadata(format!(
                    "param state of type {} has no sharding type tag",
                    param_state.sharding_type()
                )))
            }
        }

        // Param state is in; only now take the group configs and scaler.
        for ((group, range), config) in self
            .groups
            .iter_mut()
            .zip(&mut self.assembly.ranges)
            .zip(state.param_groups)
        {
            range.orig_group = config.clone();
            group.config = config;
        }

        match (self.config.fp16, state.grad_scaler) {
            (true, Some(scaler)) => self.grad_scaler = Some(scaler),
            (true, None) => info!(
                "***WARNING*** found an old checkpoint, will not load grad scaler state"
            ),
            (false, Some(_)) => info!(
                "***WARNING*** fp16 is disabled, ignoring grad scaler state found in checkpoint"
            ),
            (false, None) => {}
        }
        Ok(())
    }

    /// Gather param state onto the root and write it to `path` there.
    ///
    /// Collective over `comm`; only the root touches the filesystem.
    pub fn save_parameter_state(&self, path: impl AsRef<Path>, comm: &dyn Communicator) -> Result<()> {
        let state = dp_zero::gather_world_state(self, comm)?;
        if let Some(state) = state {
            dp_zero::save(path.as_ref(), &state)?;
            debug!(path = %path.as_ref().display(), "saved dp-zero parameter state");
        }
        Ok(())
    }

    /// Read param state on the root and scatter it to every rank.
    ///
    /// With `update_legacy_format`, the file must hold the per-bucket legacy
    /// layout, which is re-bucketed to the live layout before scattering.
    pub fn load_parameter_state(
        &mut self,
        path: impl AsRef<Path>,
        comm: &dyn Communicator,
        update_legacy_format: bool,
    ) -> Result<()> {
        let file = if comm.is_root() {
            Some(dp_zero::load(path.as_ref())?)
        } else {
            None
        };
        if update_legacy_format {
            let legacy = match file {
                Some(DpZeroFile::Legacy(legacy)) => Some(legacy),
                Some(DpZeroFile::Coalesced(_)) => {
                    return Err(Error::Internal(
                        "update_legacy_format requested for a coalesced checkpoint".to_string(),
                    ))
                }
                None => None,
            };
            dp_zero::scatter_legacy_state(self, legacy, comm)
        } else {
            let state = match file {
                Some(DpZeroFile::Coalesced(state)) => Some(state),
                Some(DpZeroFile::Legacy(_)) => {
                    return Err(Error::Internal(
                        "legacy per-bucket checkpoint needs update_legacy_format".to_string(),
                    ))
                }
                None => None,
            };
            dp_zero::scatter_world_state(self, state, comm)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferLayout, Fp8Meta};
    use crate::checkpoint::ParamState;
    use crate::comm::SoloComm;
    use crate::dtype::{DType, DtypePair};

    fn optimizer(dtype: DType) -> DistributedOptimizer {
        let params = (0..3)
            .map(|i| ModelParam::new(i, format!("layer.{i}.weight"), &[2, 2]))
            .collect();
        let buffer = GradBuffer::build(
            DtypePair::new(dtype, DType::F32),
            params,
            BufferLayout::new(1),
        )
        .unwrap();
        let groups = [
            ParamGroup::new([0, 1], GroupConfig::default()),
            ParamGroup::new(
                [2],
                GroupConfig {
                    weight_decay: 0.1,
                    ..GroupConfig::default()
                },
            ),
        ];
        DistributedOptimizer::new(OptimizerConfig::default(), vec![buffer], &groups, 0, 1).unwrap()
    }

    fn sgd(group: &GroupConfig, param: &mut [f32], grad: &[f32], state: &mut AdamState) -> Result<()> {
        for ((p, g), m) in param.iter_mut().zip(grad).zip(&mut state.exp_avg) {
            *m += g;
            *p -= group.lr * g;
        }
        Ok(())
    }

    #[test]
    fn test_step_updates_model_params() {
        let mut opt = optimizer(DType::BF16);
        let buffer = &opt.buffers()[0];
        buffer.grad_data().full_view().copy_from_f32(&[1000.0; 12]).unwrap();
        buffer.param_data().full_view().copy_from_f32(&[2.0; 12]).unwrap();
        opt.copy_model_params_to_main_params().unwrap();

        let mut update = sgd;
        opt.step(&mut update, &SoloComm).unwrap();

        let params = opt.buffers()[0].param_data().full_view().to_f32_vec().unwrap();
        assert_eq!(params, vec![1.0; 12]);
        let state = opt.adam_state(ParamId(1)).unwrap();
        assert_eq!(state.exp_avg, vec![1000.0; 4]);
    }

    #[test]
    fn test_write_and_read_shard() {
        let mut opt = optimizer(DType::F32);
        opt.write_shard(ParamId(2), StateKey::ExpAvgSq, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        opt.write_shard(ParamId(2), StateKey::Param, &[5.0; 4]).unwrap();
        let shard = opt.read_shard(ParamId(2)).unwrap();
        assert_eq!(shard.exp_avg_sq, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(shard.param, vec![5.0; 4]);

        let err = opt
            .write_shard(ParamId(2), StateKey::ExpAvg, &[1.0])
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 4, got: 1, .. }));
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut opt = optimizer(DType::F32);
        let mut dict = opt.state_dict();
        assert_eq!(dict.param_groups.len(), 2);
        dict.param_groups[0].lr = 0.25;
        opt.load_state_dict(dict, None, &SoloComm).unwrap();
        assert_eq!(opt.shard_groups()[0].config.lr, 0.25);
        assert_eq!(opt.group_assembly().ranges[0].orig_group.lr, 0.25);
    }

    #[test]
    fn test_failed_param_state_load_keeps_group_configs() {
        let mut opt = optimizer(DType::F32);
        let mut dict = opt
            .sharded_state_dict(Some(ShardingType::FullyShardedBucketSpace), None, &SoloComm)
            .unwrap();
        dict.param_groups[0].lr = 0.25;
        let Some(ParamState::BucketSpace(state)) = dict.param_state.as_mut() else {
            panic!("expected bucket-space state");
        };
        state.layouts[0].numel_unpadded[0] += 1;

        assert!(opt.load_state_dict(dict, None, &SoloComm).is_err());
        assert_eq!(opt.shard_groups()[0].config.lr, GroupConfig::default().lr);
        assert_eq!(
            opt.group_assembly().ranges[0].orig_group.lr,
            GroupConfig::default().lr
        );
    }

    #[test]
    fn test_sharded_state_dict_defaults_to_configured_type() {
        let mut opt = optimizer(DType::F32);
        opt.config.sharding_type = ShardingType::DpZeroGatherScatter;
        let dict = opt.sharded_state_dict(None, None, &SoloComm).unwrap();
        assert_eq!(
            dict.param_state_sharding_type.as_deref(),
            Some("dp_zero_gather_scatter")
        );
        assert!(matches!(dict.param_state, Some(ParamState::DpZero(Some(_)))));

        // The default model-space encoding needs a metadata provider.
        opt.config.sharding_type = ShardingType::default();
        let err = opt.sharded_state_dict(None, None, &SoloComm).unwrap_err();
        assert!(matches!(err, Error::MissingMetadata(_)));
    }

    #[test]
    fn test_load_state_dict_rejects_unknown_tag() {
        let mut opt = optimizer(DType::F32);
        let mut dict = opt.state_dict();
        dict.param_state_sharding_type = Some("fully_reshardable".to_string());
        let err = opt.load_state_dict(dict, None, &SoloComm).unwrap_err();
        assert!(matches!(err, Error::UnknownEncoding(_)));
    }

    #[test]
    fn test_fp8_scale_inv_refresh() {
        let params = vec![
            ModelParam::new(0, "w", &[4]).with_fp8_meta(Fp8Meta {
                scale: 4.0,
                scale_inv: 0.0,
                amax: 3.0,
            }),
            ModelParam::new(1, "b", &[4]),
        ];
        let buffer = GradBuffer::build(
            DtypePair::new(DType::BF16, DType::F32),
            params,
            BufferLayout::new(1),
        )
        .unwrap();
        let groups = [ParamGroup::new([0, 1], GroupConfig::default())];
        let mut opt =
            DistributedOptimizer::new(OptimizerConfig::default(), vec![buffer], &groups, 0, 1).unwrap();
        opt.update_fp8_scale_inv_and_amax(&SoloComm).unwrap();
        let meta = opt.param(ParamId(0)).unwrap().fp8_meta.unwrap();
        assert_eq!(meta.scale_inv, 0.25);
        assert_eq!(meta.amax, 3.0);
    }
}
