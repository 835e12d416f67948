//! Re-grouping of owned param shards into the logical optimizer groups.

use std::collections::BTreeMap;

use crate::buffer::ParamId;
use crate::config::GroupConfig;
use crate::param_map::BufferRangeMap;
use crate::{Error, Result};

/// A logical optimizer group, before sharding.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub params: Vec<ParamId>,
    pub config: GroupConfig,
}

impl ParamGroup {
    #[must_use]
    pub fn new(params: impl IntoIterator<Item = usize>, config: GroupConfig) -> Self {
        Self {
            params: params.into_iter().map(ParamId).collect(),
            config,
        }
    }
}

/// Position of an owned param inside the sharded groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GroupPosition {
    pub group: usize,
    pub order: usize,
}

/// The locally-owned subset of one logical group.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerGroupRange {
    pub group_index: usize,
    /// Owned params in assembly order.
    pub params: Vec<ParamId>,
    pub orig_group: GroupConfig,
}

/// Result of group assembly for one rank.
#[derive(Debug, Clone)]
pub struct GroupAssembly {
    /// One entry per logical group, empty ones included.
    pub ranges: Vec<OptimizerGroupRange>,
    pub positions: BTreeMap<ParamId, GroupPosition>,
}

impl GroupAssembly {
    #[must_use]
    pub fn position(&self, id: ParamId) -> Option<GroupPosition> {
        self.positions.get(&id).copied()
    }
}

/// Assign every owned param a `(group, order)` position.
///
/// Owned params are visited buffer by buffer, bucket by bucket, in
/// shard-local order, and appended to their group's list. The resulting
/// order is what positional checkpoint state is keyed by, so it must be
/// the same on every call.
pub fn assemble_groups(groups: &[ParamGroup], maps: &[BufferRangeMap]) -> Result<GroupAssembly> {
    let mut group_of = BTreeMap::new();
    for (index, group) in groups.iter().enumerate() {
        for id in &group.params {
            if group_of.insert(*id, index).is_some() {
                return Err(Error::Internal(format!(
                    "param {} listed in more than one optimizer group",
                    id.0
                )));
            }
        }
    }

    let mut ranges: Vec<OptimizerGroupRange> = groups
        .iter()
        .enumerate()
        .map(|(group_index, g)| OptimizerGroupRange {
            group_index,
            params: Vec::new(),
            orig_group: g.config.clone(),
        })
        .collect();
    let mut positions = BTreeMap::new();

    for map in maps {
        for (_, id, _) in map.owned() {
            let group = *group_of.get(&id).ok_or_else(|| {
                Error::Internal(format!("owned param {} belongs to no optimizer group", id.0))
            })?;
            let range = &mut ranges[group];
            positions.insert(
                id,
                GroupPosition {
                    group,
                    order: range.params.len(),
                },
            );
            range.params.push(id);
        }
    }

    Ok(GroupAssembly { ranges, positions })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferLayout, GradBuffer, ModelParam};
    use crate::dtype::{DType, DtypePair};

    fn buffer() -> GradBuffer {
        let params = (0..4)
            .map(|i| ModelParam::new(i, format!("p{i}"), &[4]))
            .collect();
        GradBuffer::build(
            DtypePair::new(DType::F32, DType::F32),
            params,
            BufferLayout::new(1),
        )
        .unwrap()
    }

    #[test]
    fn test_assembly_order_and_empty_groups() {
        let buf = buffer();
        let maps = [BufferRangeMap::build(&buf, 1, 0).unwrap()];
        let groups = [
            ParamGroup::new([0, 2], GroupConfig::default()),
            ParamGroup::new([], GroupConfig::default()),
            ParamGroup::new([1, 3], GroupConfig::default()),
        ];
        let assembly = assemble_groups(&groups, &maps).unwrap();

        assert_eq!(assembly.ranges.len(), 3);
        assert!(assembly.ranges[1].params.is_empty());
        // Layout order is reverse declaration order.
        assert_eq!(assembly.ranges[0].params, vec![ParamId(2), ParamId(0)]);
        assert_eq!(assembly.ranges[2].params, vec![ParamId(3), ParamId(1)]);
        assert_eq!(
            assembly.position(ParamId(0)),
            Some(GroupPosition { group: 0, order: 1 })
        );
    }

    #[test]
    fn test_assembly_is_stable() {
        let buf = buffer();
        let maps = [BufferRangeMap::build(&buf, 1, 0).unwrap()];
        let groups = [ParamGroup::new(0..4, GroupConfig::default())];
        let a = assemble_groups(&groups, &maps).unwrap();
        let b = assemble_groups(&groups, &maps).unwrap();
        assert_eq!(a.positions, b.positions);
    }

    #[test]
    fn test_param_without_group() {
        let buf = buffer();
        let maps = [BufferRangeMap::build(&buf, 1, 0).unwrap()];
        let groups = [ParamGroup::new([0, 1, 2], GroupConfig::default())];
        let err = assemble_groups(&groups, &maps).unwrap_err();
        assert!(matches!(err, Error::Internal(ref m) if m.contains("param 3")));
    }
}
