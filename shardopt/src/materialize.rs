//! Materialization of the physical shards the update routine operates on.

use std::collections::BTreeMap;

use tracing::debug;

use crate::buffer::{GradBuffer, ParamAttrs, ParamId};
use crate::config::GroupConfig;
use crate::dtype::{DType, ShardDtype};
use crate::groups::GroupAssembly;
use crate::param_map::{BufferRangeMap, ParamLocation};
use crate::storage::{ShardView, Storage};
use crate::{Error, Result};

/// The shard(s) of one owned param.
#[derive(Debug, Clone)]
pub enum ShardRecord {
    /// f16/bf16 param: a view into model storage plus a separate f32 main copy.
    Reduced {
        param: ParamId,
        dtype: ShardDtype,
        model: ShardView,
        main: ShardView,
        attrs: ParamAttrs,
    },
    /// f32 param: the model view is the operand.
    Float32 {
        param: ParamId,
        shard: ShardView,
        attrs: ParamAttrs,
    },
}

impl ShardRecord {
    #[must_use]
    pub fn param(&self) -> ParamId {
        match self {
            Self::Reduced { param, .. } | Self::Float32 { param, .. } => *param,
        }
    }

    #[must_use]
    pub fn dtype(&self) -> ShardDtype {
        match self {
            Self::Reduced { dtype, .. } => *dtype,
            Self::Float32 { .. } => ShardDtype::Float32,
        }
    }

    /// The owned slice of the model param, in model storage.
    #[must_use]
    pub fn model_shard(&self) -> &ShardView {
        match self {
            Self::Reduced { model, .. } => model,
            Self::Float32 { shard, .. } => shard,
        }
    }

    /// The full-precision operand handed to the update routine.
    #[must_use]
    pub fn main_param(&self) -> &ShardView {
        match self {
            Self::Reduced { main, .. } => main,
            Self::Float32 { shard, .. } => shard,
        }
    }

    #[must_use]
    pub fn attrs(&self) -> &ParamAttrs {
        match self {
            Self::Reduced { attrs, .. } | Self::Float32 { attrs, .. } => attrs,
        }
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.main_param().numel()
    }
}

/// One logical group's operand set.
#[derive(Debug, Clone)]
pub struct ShardGroup {
    pub group_index: usize,
    pub config: GroupConfig,
    /// In assembly order, so `records[i]` is the param at order `i`.
    pub records: Vec<ShardRecord>,
}

/// Build every owned param's shard record, grouped as assembled.
///
/// High-precision init values, when a param carries them, seed the main
/// copy and are dropped afterwards.
pub fn materialize_shards(
    buffers: &mut [GradBuffer],
    maps: &[BufferRangeMap],
    locations: &BTreeMap<ParamId, ParamLocation>,
    assembly: &GroupAssembly,
) -> Result<Vec<ShardGroup>> {
    let mut groups = Vec::with_capacity(assembly.ranges.len());
    for range in &assembly.ranges {
        let mut records = Vec::with_capacity(range.params.len());
        for &id in &range.params {
            let location = locations.get(&id).ok_or_else(|| {
                Error::Internal(format!("param {} has no buffer location", id.0))
            })?;
            let map = maps[location.buffer].buckets[location.bucket]
                .get(id)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "param {} missing from bucket {} range map",
                        id.0, location.bucket
                    ))
                })?;
            let buffer = &mut buffers[location.buffer];
            let model = buffer.param_view(id)?.sub_view(map.within_param)?;
            if model.numel() != map.shard_local.size() {
                return Err(Error::size_mismatch(
                    format!("shard of param {}", id.0),
                    map.shard_local.size(),
                    model.numel(),
                ));
            }

            let param = buffer.param_mut(id).ok_or_else(|| {
                Error::Internal(format!("param {} not found in its buffer", id.0))
            })?;
            let attrs = param.attrs.clone();
            // Released for every dtype.
            let init = param.high_precision_init.take();
            let record = match ShardDtype::try_from(model.dtype())? {
                dtype @ (ShardDtype::Half | ShardDtype::BFloat16) => {
                    let values = match init {
                        Some(init) => init
                            .get(map.within_param.as_std())
                            .ok_or_else(|| {
                                Error::size_mismatch(
                                    format!("high precision init of param {}", id.0),
                                    map.within_param.end,
                                    init.len(),
                                )
                            })?
                            .to_vec(),
                        None => model.to_f32_vec()?,
                    };
                    ShardRecord::Reduced {
                        param: id,
                        dtype,
                        main: Storage::from_f32(DType::F32, &values)?.full_view(),
                        model,
                        attrs,
                    }
                }
                ShardDtype::Float32 => {
                    drop(init);
                    ShardRecord::Float32 {
                        param: id,
                        shard: model,
                        attrs,
                    }
                }
            };
            records.push(record);
        }
        debug!(
            group = range.group_index,
            shards = records.len(),
            "materialized optimizer group"
        );
        groups.push(ShardGroup {
            group_index: range.group_index,
            config: range.orig_group.clone(),
            records,
        });
    }
    Ok(groups)
}
