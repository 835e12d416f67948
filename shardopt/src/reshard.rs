//! Dtype-split resharding of coalesced checkpoints.
//!
//! A run without fp8 param storage keeps weights and biases in one buffer,
//! so its checkpoint holds one world tensor per key covering both. A run
//! with fp8 params keeps the fp8 weights in their own buffer. Loading the
//! first kind of checkpoint into the second kind of run needs the coalesced
//! tensor split in two, and loading the second kind into the first needs
//! the two merged back.
//!
//! Buffers are laid out in reverse declaration order, so the interleaving
//! of the two classes inside the coalesced tensor is recovered by walking
//! the per-param fp8 flags backwards.

use std::collections::HashMap;

use tracing::info;

use crate::buffer::{GradBuffer, ModelParam};
use crate::checkpoint::DpZeroBuffer;
use crate::checkpoint::DpZeroState;
use crate::dtype::DtypePair;
use crate::state::{StateKey, StateTensors};
use crate::{Error, Result};

/// Result of [`split_state_if_needed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOutcome {
    /// No live buffer is fp8.
    NotNeeded,
    /// The checkpoint already carries a `u8` key; left untouched.
    AlreadySplit,
    /// This many fp8 buffers were carved out of the checkpoint.
    Split(usize),
}

/// Per-declaration-index fp8 flags for two buffers that together hold
/// params `0..n`.
pub fn fp8_flags(fp8_indices: &[usize], non_fp8_indices: &[usize]) -> Result<Vec<bool>> {
    let n = fp8_indices.len() + non_fp8_indices.len();
    let mut flags: Vec<Option<bool>> = vec![None; n];
    for (indices, flag) in [(fp8_indices, true), (non_fp8_indices, false)] {
        for &i in indices {
            let slot = flags.get_mut(i).ok_or_else(|| {
                Error::MissingMetadata(format!("param index {i} outside 0..{n}"))
            })?;
            if slot.replace(flag).is_some() {
                return Err(Error::MissingMetadata(format!(
                    "param index {i} appears in both buffers"
                )));
            }
        }
    }
    flags
        .into_iter()
        .enumerate()
        .map(|(i, f)| f.ok_or_else(|| Error::MissingMetadata(format!("param index {i} has no buffer"))))
        .collect()
}

/// Contiguous segments of the coalesced tensor, as `(is_fp8, numel)`.
///
/// `fp8_numels` and `non_fp8_numels` are each class's param sizes in
/// declaration order.
fn segments(flags: &[bool], fp8_numels: &[usize], non_fp8_numels: &[usize]) -> Result<Vec<(bool, usize)>> {
    let mut fp8 = fp8_numels.iter().rev();
    let mut non_fp8 = non_fp8_numels.iter().rev();
    let segments = flags
        .iter()
        .rev()
        .map(|&flag| {
            let next = if flag { fp8.next() } else { non_fp8.next() };
            next.map(|&numel| (flag, numel)).ok_or_else(|| {
                Error::MissingMetadata(format!(
                    "more {} flags than params",
                    if flag { "fp8" } else { "non-fp8" }
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if fp8.next().is_some() || non_fp8.next().is_some() {
        return Err(Error::MissingMetadata(
            "fewer flags than params in the two buffers".to_string(),
        ));
    }
    Ok(segments)
}

/// Split a coalesced tensor into `(fp8, non_fp8)` parts.
pub fn split_by_flags(
    tensor: &[f32],
    flags: &[bool],
    fp8_numels: &[usize],
    non_fp8_numels: &[usize],
) -> Result<(Vec<f32>, Vec<f32>)> {
    let segments = segments(flags, fp8_numels, non_fp8_numels)?;
    let total: usize = segments.iter().map(|(_, n)| n).sum();
    if total != tensor.len() {
        return Err(Error::size_mismatch("coalesced tensor", total, tensor.len()));
    }
    let mut fp8 = Vec::with_capacity(fp8_numels.iter().sum());
    let mut non_fp8 = Vec::with_capacity(non_fp8_numels.iter().sum());
    let mut offset = 0;
    for (flag, numel) in segments {
        let segment = &tensor[offset..offset + numel];
        if flag {
            fp8.extend_from_slice(segment);
        } else {
            non_fp8.extend_from_slice(segment);
        }
        offset += numel;
    }
    Ok((fp8, non_fp8))
}

/// Inverse of [`split_by_flags`].
pub fn merge_by_flags(
    fp8: &[f32],
    non_fp8: &[f32],
    flags: &[bool],
    fp8_numels: &[usize],
    non_fp8_numels: &[usize],
) -> Result<Vec<f32>> {
    let segments = segments(flags, fp8_numels, non_fp8_numels)?;
    let (mut fp8_offset, mut non_fp8_offset) = (0, 0);
    let mut merged = Vec::with_capacity(fp8.len() + non_fp8.len());
    for (flag, numel) in segments {
        let (src, offset) = if flag {
            (fp8, &mut fp8_offset)
        } else {
            (non_fp8, &mut non_fp8_offset)
        };
        let segment = src.get(*offset..*offset + numel).ok_or_else(|| {
            Error::size_mismatch(
                if flag { "fp8 tensor" } else { "non-fp8 tensor" },
                *offset + numel,
                src.len(),
            )
        })?;
        merged.extend_from_slice(segment);
        *offset += numel;
    }
    if fp8_offset != fp8.len() || non_fp8_offset != non_fp8.len() {
        return Err(Error::size_mismatch(
            "split tensors",
            fp8_offset + non_fp8_offset,
            fp8.len() + non_fp8.len(),
        ));
    }
    Ok(merged)
}

/// Split a coalesced checkpoint so every live fp8 buffer gets its own entry.
///
/// Runs on the root before scattering. A checkpoint that already carries a
/// `u8` key was saved from an fp8 run and is left as is. Otherwise the
/// checkpoint's keys must be unique, and on return its entries are in live
/// buffer order.
pub fn split_state_if_needed(state: &mut DpZeroState, buffers: &[GradBuffer]) -> Result<SplitOutcome> {
    let fp8_count = buffers.iter().filter(|b| b.is_fp8()).count();
    if fp8_count == 0 {
        return Ok(SplitOutcome::NotNeeded);
    }
    if state.buffers.iter().any(|b| b.key.is_fp8_sentinel()) {
        info!("checkpoint already separates fp8 params, skipping dtype split");
        return Ok(SplitOutcome::AlreadySplit);
    }

    let mut by_key: HashMap<DtypePair, DpZeroBuffer> = HashMap::new();
    for entry in std::mem::take(&mut state.buffers) {
        let key = entry.key;
        if by_key.insert(key, entry).is_some() {
            return Err(Error::MissingMetadata(format!(
                "checkpoint holds more than one {key} buffer, cannot split it by dtype"
            )));
        }
    }

    let mut carved: Vec<Option<DpZeroBuffer>> = vec![None; buffers.len()];
    for (index, fp8_buffer) in buffers.iter().enumerate().filter(|(_, b)| b.is_fp8()) {
        let non_fp8_key = fp8_buffer.storage_dtype();
        let non_fp8_buffer = buffers
            .iter()
            .find(|b| !b.is_fp8() && b.dtype() == non_fp8_key)
            .ok_or_else(|| {
                Error::MissingMetadata(format!(
                    "no live {non_fp8_key} buffer to split fp8 buffer {} from",
                    fp8_buffer.dtype()
                ))
            })?;

        let flags = fp8_flags(&fp8_buffer.param_indices(), &non_fp8_buffer.param_indices())?;
        let fp8_numels: Vec<usize> = fp8_buffer.params().iter().map(ModelParam::numel).collect();
        let non_fp8_numels: Vec<usize> = non_fp8_buffer.params().iter().map(ModelParam::numel).collect();

        let entry = by_key.get_mut(&non_fp8_key).ok_or_else(|| {
            Error::MissingMetadata(format!("checkpoint has no {non_fp8_key} state to split"))
        })?;
        let mut fp8_tensors = StateTensors::default();
        let mut non_fp8_tensors = StateTensors::default();
        for key in StateKey::ALL {
            let (fp8, non_fp8) = split_by_flags(entry.tensors.get(key), &flags, &fp8_numels, &non_fp8_numels)?;
            *fp8_tensors.get_mut(key) = fp8;
            *non_fp8_tensors.get_mut(key) = non_fp8;
        }

        entry.numel_unpadded = non_fp8_tensors.numel()?;
        entry.tensors = non_fp8_tensors;
        entry.param_indices = non_fp8_buffer.param_indices();
        entry.param_numels = non_fp8_numels;
        carved[index] = Some(DpZeroBuffer {
            key: fp8_buffer.dtype(),
            numel_unpadded: fp8_tensors.numel()?,
            tensors: fp8_tensors,
            param_indices: fp8_buffer.param_indices(),
            param_numels: fp8_numels,
        });
        info!(
            fp8_key = %fp8_buffer.dtype(),
            %non_fp8_key,
            "split coalesced checkpoint state by param dtype"
        );
    }

    state.buffers = buffers
        .iter()
        .zip(carved)
        .map(|(buffer, carved)| match carved {
            Some(entry) => Ok(entry),
            None => by_key.remove(&buffer.dtype()).ok_or_else(|| {
                Error::MissingMetadata(format!("checkpoint has no state for buffer {}", buffer.dtype()))
            }),
        })
        .collect::<Result<_>>()?;
    if !by_key.is_empty() {
        return Err(Error::size_mismatch(
            "grad buffers (current run vs checkpoint)",
            buffers.len(),
            buffers.len() + by_key.len(),
        ));
    }
    Ok(SplitOutcome::Split(fp8_count))
}

/// Fold every `u8` entry of a checkpoint back into the entry it was split
/// from, for a run that keeps no fp8 buffer. Returns how many were merged.
///
/// The partner of an fp8 entry is the one non-fp8 entry with the same grad
/// dtype. Merged entries take the partner's position; the relative order of
/// the remaining entries is kept.
pub fn merge_state_if_needed(state: &mut DpZeroState, buffers: &[GradBuffer]) -> Result<usize> {
    if buffers.iter().any(GradBuffer::is_fp8) || !state.buffers.iter().any(|b| b.key.is_fp8_sentinel()) {
        return Ok(0);
    }
    let (fp8_entries, mut rest): (Vec<_>, Vec<_>) = std::mem::take(&mut state.buffers)
        .into_iter()
        .partition(|b| b.key.is_fp8_sentinel());
    let merged = fp8_entries.len();

    for fp8 in fp8_entries {
        let mut partners = rest.iter_mut().filter(|b| b.key.grad == fp8.key.grad);
        let partner = match (partners.next(), partners.next()) {
            (Some(partner), None) => partner,
            (None, _) => {
                return Err(Error::MissingMetadata(format!(
                    "checkpoint has no buffer to merge fp8 buffer {} into",
                    fp8.key
                )))
            }
            (Some(_), Some(_)) => {
                return Err(Error::MissingMetadata(format!(
                    "more than one checkpoint buffer could take fp8 buffer {}",
                    fp8.key
                )))
            }
        };
        if fp8.param_indices.is_empty() || partner.param_indices.is_empty() {
            return Err(Error::MissingMetadata(format!(
                "checkpoint does not record the params of {} and {}",
                fp8.key, partner.key
            )));
        }

        let flags = fp8_flags(&fp8.param_indices, &partner.param_indices)?;
        let mut tensors = StateTensors::default();
        for key in StateKey::ALL {
            *tensors.get_mut(key) = merge_by_flags(
                fp8.tensors.get(key),
                partner.tensors.get(key),
                &flags,
                &fp8.param_numels,
                &partner.param_numels,
            )?;
        }

        let mut params: Vec<(usize, usize)> = fp8
            .param_indices
            .iter()
            .copied()
            .zip(fp8.param_numels.iter().copied())
            .chain(
                partner
                    .param_indices
                    .iter()
                    .copied()
                    .zip(partner.param_numels.iter().copied()),
            )
            .collect();
        params.sort_unstable();
        (partner.param_indices, partner.param_numels) = params.into_iter().unzip();
        partner.numel_unpadded = tensors.numel()?;
        partner.tensors = tensors;
        info!(
            fp8_key = %fp8.key,
            key = %partner.key,
            "merged fp8 checkpoint state into coalesced buffer"
        );
    }

    state.buffers = rest;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferLayout;
    use crate::dtype::DType;

    #[test]
    fn test_fp8_flags() {
        assert_eq!(
            fp8_flags(&[0, 2], &[1, 3]).unwrap(),
            vec![true, false, true, false]
        );
        assert!(fp8_flags(&[0, 1], &[1]).is_err());
        assert!(fp8_flags(&[0, 5], &[1]).is_err());
    }

    #[test]
    fn test_split_then_merge_single_elements() {
        let tensor: Vec<f32> = (0..6).map(|i| i as f32).collect();
        let flags = [true, false, false, true, true, false];
        let (fp8, non_fp8) = split_by_flags(&tensor, &flags, &[1; 3], &[1; 3]).unwrap();
        // Walked backwards: the last declared param sits first.
        assert_eq!(fp8, vec![1.0, 2.0, 5.0]);
        assert_eq!(non_fp8, vec![0.0, 3.0, 4.0]);
        let merged = merge_by_flags(&fp8, &non_fp8, &flags, &[1; 3], &[1; 3]).unwrap();
        assert_eq!(merged, tensor);
    }

    #[test]
    fn test_split_then_merge_mixed_sizes() {
        let flags = [true, false, true];
        let fp8_numels = [3, 2];
        let non_fp8_numels = [4];
        let tensor: Vec<f32> = (0..9).map(|i| i as f32 * 0.5).collect();
        let (fp8, non_fp8) = split_by_flags(&tensor, &flags, &fp8_numels, &non_fp8_numels).unwrap();
        assert_eq!(fp8.len() + non_fp8.len(), tensor.len());
        assert_eq!(fp8, vec![0.0, 0.5, 3.0, 3.5, 4.0]);
        assert_eq!(non_fp8, vec![1.0, 1.5, 2.0, 2.5]);
        assert_eq!(
            merge_by_flags(&fp8, &non_fp8, &flags, &fp8_numels, &non_fp8_numels).unwrap(),
            tensor
        );
    }

    #[test]
    fn test_split_rejects_wrong_total() {
        let err = split_by_flags(&[0.0; 5], &[true, false], &[2], &[2]).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 4, got: 5, .. }));
    }

    fn buffers() -> Vec<GradBuffer> {
        let fp8 = GradBuffer::build(
            DtypePair::new(DType::BF16, DType::F32),
            vec![ModelParam::new(0, "w0", &[3]), ModelParam::new(2, "w1", &[2])],
            BufferLayout::new(1),
        )
        .unwrap()
        .into_fp8();
        let bias = GradBuffer::build(
            DtypePair::new(DType::BF16, DType::F32),
            vec![ModelParam::new(1, "b0", &[1]), ModelParam::new(3, "b1", &[1])],
            BufferLayout::new(1),
        )
        .unwrap();
        vec![fp8, bias]
    }

    fn coalesced_buffer() -> GradBuffer {
        GradBuffer::build(
            DtypePair::new(DType::BF16, DType::F32),
            vec![
                ModelParam::new(0, "w0", &[3]),
                ModelParam::new(1, "b0", &[1]),
                ModelParam::new(2, "w1", &[2]),
                ModelParam::new(3, "b1", &[1]),
            ],
            BufferLayout::new(1),
        )
        .unwrap()
    }

    // Coalesced reverse order: b1(1) w1(2) b0(1) w0(3).
    fn coalesced_state() -> DpZeroState {
        let param = vec![10.0, 20.0, 21.0, 30.0, 40.0, 41.0, 42.0];
        DpZeroState {
            buffers: vec![DpZeroBuffer {
                key: DtypePair::new(DType::BF16, DType::F32),
                numel_unpadded: 7,
                tensors: StateTensors {
                    exp_avg: param.iter().map(|v| v + 0.5).collect(),
                    exp_avg_sq: vec![0.0; 7],
                    param,
                },
                param_indices: vec![0, 1, 2, 3],
                param_numels: vec![3, 1, 2, 1],
            }],
        }
    }

    #[test]
    fn test_split_state() {
        let key = DtypePair::new(DType::BF16, DType::F32);
        let mut state = coalesced_state();
        let outcome = split_state_if_needed(&mut state, &buffers()).unwrap();
        assert_eq!(outcome, SplitOutcome::Split(1));

        // Entries follow the live buffers: fp8 first, then biases.
        let fp8 = state.buffer(0, DtypePair::new(DType::U8, DType::F32)).unwrap();
        let bias = state.buffer(1, key).unwrap();
        assert_eq!(bias.tensors.param, vec![10.0, 30.0]);
        assert_eq!(bias.numel_unpadded, 2);
        assert_eq!(bias.param_indices, vec![1, 3]);
        assert_eq!(fp8.param_numels, vec![3, 2]);
        assert_eq!(fp8.tensors.param, vec![20.0, 21.0, 40.0, 41.0, 42.0]);
        assert_eq!(fp8.tensors.exp_avg, vec![20.5, 21.5, 40.5, 41.5, 42.5]);
        assert_eq!(fp8.numel_unpadded + bias.numel_unpadded, 7);

        assert_eq!(
            split_state_if_needed(&mut state, &buffers()).unwrap(),
            SplitOutcome::AlreadySplit
        );
    }

    #[test]
    fn test_split_not_needed_without_fp8() {
        let mut state = DpZeroState::default();
        let live = vec![buffers().pop().unwrap()];
        assert_eq!(
            split_state_if_needed(&mut state, &live).unwrap(),
            SplitOutcome::NotNeeded
        );
    }

    #[test]
    fn test_merge_undoes_split() {
        let mut state = coalesced_state();
        split_state_if_needed(&mut state, &buffers()).unwrap();

        let live = [coalesced_buffer()];
        assert_eq!(merge_state_if_needed(&mut state, &live).unwrap(), 1);
        assert_eq!(state, coalesced_state());
        assert_eq!(merge_state_if_needed(&mut state, &live).unwrap(), 0);
    }

    #[test]
    fn test_merge_needs_recorded_params() {
        let mut state = coalesced_state();
        split_state_if_needed(&mut state, &buffers()).unwrap();
        state.buffers[1].param_indices.clear();
        let err = merge_state_if_needed(&mut state, &[coalesced_buffer()]).unwrap_err();
        assert!(matches!(err, Error::MissingMetadata(_)));
    }

    #[test]
    fn test_split_rejects_duplicate_checkpoint_keys() {
        let mut state = coalesced_state();
        state.buffers.push(state.buffers[0].clone());
        let err = split_state_if_needed(&mut state, &buffers()).unwrap_err();
        assert!(matches!(err, Error::MissingMetadata(_)));
    }
}
