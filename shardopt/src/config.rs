//! Optimizer configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::buffer::BufferLayout;
use crate::checkpoint::ShardingType;
use crate::Result;

/// Configuration for the distributed optimizer
///
/// Parsed from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Whether a dynamic loss scaler is in use
    #[serde(default)]
    pub fp16: bool,

    /// Encoding used for sharded checkpoints
    #[serde(default)]
    pub sharding_type: ShardingType,

    /// Elements per bucket (`None`: one bucket per buffer)
    #[serde(default)]
    pub bucket_size: Option<usize>,

    /// Pad buckets to a multiple of `lcm(world_size, 128, 2^16)`
    #[serde(default)]
    pub pad_buckets_for_high_nccl_busbw: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            fp16: false,
            sharding_type: ShardingType::default(),
            bucket_size: None,
            pad_buckets_for_high_nccl_busbw: false,
        }
    }
}

impl OptimizerConfig {
    /// Load configuration from a JSON file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Bucket layout for a data-parallel group of `world_size` ranks.
    #[must_use]
    pub fn buffer_layout(&self, world_size: usize) -> BufferLayout {
        BufferLayout {
            world_size,
            bucket_size: self.bucket_size,
            pad_for_high_nccl_busbw: self.pad_buckets_for_high_nccl_busbw,
        }
    }
}

/// Hyper-parameters of one logical optimizer group.
///
/// Carried opaquely: the sharding engine only copies it into checkpoints and
/// hands it to the update routine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default = "default_lr")]
    pub lr: f32,

    #[serde(default)]
    pub weight_decay: f32,

    #[serde(default = "default_betas")]
    pub betas: (f32, f32),

    #[serde(default = "default_eps")]
    pub eps: f32,

    /// Anything else the update routine wants to carry along
    #[serde(default)]
    pub extra: serde_json::Value,
}

fn default_lr() -> f32 {
    1e-3
}

fn default_betas() -> (f32, f32) {
    (0.9, 0.999)
}

fn default_eps() -> f32 {
    1e-8
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            weight_decay: 0.0,
            betas: default_betas(),
            eps: default_eps(),
            extra: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: OptimizerConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.fp16);
        assert_eq!(config.sharding_type, ShardingType::FullyShardedModelSpace);
        assert_eq!(config.bucket_size, None);
        assert_eq!(config.buffer_layout(4).pad_multiple(), 4);
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "fp16": true,
            "sharding_type": "dp_zero_gather_scatter",
            "bucket_size": 40000000,
            "pad_buckets_for_high_nccl_busbw": true
        }"#;
        let config: OptimizerConfig = serde_json::from_str(json).unwrap();
        assert!(config.fp16);
        assert_eq!(config.sharding_type, ShardingType::DpZeroGatherScatter);
        assert_eq!(config.buffer_layout(8).bucket_size, Some(40_000_000));
        assert_eq!(config.buffer_layout(8).pad_multiple(), 65536);
    }

    #[test]
    fn test_unknown_sharding_type_rejected() {
        let json = r#"{"sharding_type": "zero_three"}"#;
        assert!(serde_json::from_str::<OptimizerConfig>(json).is_err());
    }

    #[test]
    fn test_group_config_defaults() {
        let group: GroupConfig = serde_json::from_str(r#"{"lr": 0.5}"#).unwrap();
        assert_eq!(group.lr, 0.5);
        assert_eq!(group.betas, (0.9, 0.999));
        assert!(group.extra.is_null());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.json");
        std::fs::write(&path, r#"{"bucket_size": 128}"#).unwrap();
        let config = OptimizerConfig::from_file(&path).unwrap();
        assert_eq!(config.bucket_size, Some(128));
    }
}
