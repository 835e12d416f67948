//! Per-shard optimizer state and the non-parameter state dict.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checkpoint::{ParamState, ShardingType};
use crate::config::GroupConfig;
use crate::{Error, Result};

/// The per-shard tensors every checkpoint encoding persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    Param,
    ExpAvg,
    ExpAvgSq,
}

impl StateKey {
    /// Canonical processing order.
    pub const ALL: [Self; 3] = [Self::Param, Self::ExpAvg, Self::ExpAvgSq];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Param => "param",
            Self::ExpAvg => "exp_avg",
            Self::ExpAvgSq => "exp_avg_sq",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "param" => Ok(Self::Param),
            "exp_avg" => Ok(Self::ExpAvg),
            "exp_avg_sq" => Ok(Self::ExpAvgSq),
            other => Err(Error::MissingMetadata(format!("unknown state key {other:?}"))),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One tensor per [`StateKey`], all the same length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateTensors {
    pub param: Vec<f32>,
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
}

impl StateTensors {
    #[must_use]
    pub fn zeros(numel: usize) -> Self {
        Self {
            param: vec![0.0; numel],
            exp_avg: vec![0.0; numel],
            exp_avg_sq: vec![0.0; numel],
        }
    }

    #[must_use]
    pub fn get(&self, key: StateKey) -> &[f32] {
        match key {
            StateKey::Param => &self.param,
            StateKey::ExpAvg => &self.exp_avg,
            StateKey::ExpAvgSq => &self.exp_avg_sq,
        }
    }

    pub fn get_mut(&mut self, key: StateKey) -> &mut Vec<f32> {
        match key {
            StateKey::Param => &mut self.param,
            StateKey::ExpAvg => &mut self.exp_avg,
            StateKey::ExpAvgSq => &mut self.exp_avg_sq,
        }
    }

    /// Length of `param`; the other two must match.
    pub fn numel(&self) -> Result<usize> {
        let n = self.param.len();
        for key in [StateKey::ExpAvg, StateKey::ExpAvgSq] {
            if self.get(key).len() != n {
                return Err(Error::size_mismatch(format!("state tensor {key}"), n, self.get(key).len()));
            }
        }
        Ok(n)
    }
}

/// Moment estimates of one owned shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdamState {
    pub exp_avg: Vec<f32>,
    pub exp_avg_sq: Vec<f32>,
}

impl AdamState {
    #[must_use]
    pub fn zeros(numel: usize) -> Self {
        Self {
            exp_avg: vec![0.0; numel],
            exp_avg_sq: vec![0.0; numel],
        }
    }
}

/// Dynamic loss-scaler state, owned by the mixed-precision wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
    pub scale: f32,
    #[serde(default)]
    pub growth_tracker: u64,
    #[serde(default)]
    pub hysteresis: u64,
}

/// Checkpointable optimizer state.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerStateDict {
    /// One entry per logical group, in group-index order.
    pub param_groups: Vec<GroupConfig>,
    pub grad_scaler: Option<GradScalerState>,
    /// Encoded per-shard state, present in sharded state dicts.
    pub param_state: Option<ParamState>,
    /// Tag read from the artifact. Kept as a string so unknown tags can be
    /// reported rather than failing deserialization.
    pub param_state_sharding_type: Option<String>,
}

impl OptimizerStateDict {
    /// Attach encoded param state.
    #[must_use]
    pub fn with_param_state(mut self, state: ParamState) -> Self {
        self.param_state_sharding_type = Some(state.sharding_type().as_str().to_string());
        self.param_state = Some(state);
        self
    }

    /// The sharding type tag, validated.
    pub fn sharding_type(&self) -> Result<Option<ShardingType>> {
        self.param_state_sharding_type
            .as_deref()
            .map(str::parse)
            .transpose()
    }
}
