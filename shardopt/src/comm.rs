//! Collective communication over a data-parallel group.
//!
//! The optimizer only ever needs three collectives: a rooted gather, a
//! rooted scatter, and an all-reduce(max). All of them are synchronous and
//! blocking: every rank of the group must enter the same collective in the
//! same order, otherwise the group deadlocks or exchanges the wrong data.

use crate::{Error, Result};

/// One rank's handle on a data-parallel communicator group.
pub trait Communicator: Send + Sync {
    /// This rank's index (`0..world_size`).
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn world_size(&self) -> usize;

    /// Gather `send` from every rank onto `root`.
    ///
    /// `root` receives `Some(chunks)` ordered by rank; every other rank
    /// receives `None`.
    fn gather(&self, send: &[f32], root: usize) -> Result<Option<Vec<Vec<f32>>>>;

    /// Scatter one chunk per rank from `root`.
    ///
    /// `root` must pass `Some(chunks)` with exactly `world_size` entries;
    /// other ranks pass `None`. Every rank returns its own chunk.
    fn scatter(&self, send: Option<Vec<Vec<f32>>>, root: usize) -> Result<Vec<f32>>;

    /// Element-wise max-reduce `values` in place across all ranks.
    fn all_reduce_max(&self, values: &mut [f32]) -> Result<()>;

    /// The coordinator rank (the group's first rank).
    fn root(&self) -> usize {
        0
    }

    fn is_root(&self) -> bool {
        self.rank() == self.root()
    }
}

/// Validate a root index against the group size.
pub fn check_root(root: usize, world_size: usize) -> Result<()> {
    if root >= world_size {
        return Err(Error::Comm(format!(
            "root {root} >= world_size {world_size}"
        )));
    }
    Ok(())
}

/// Validate a root's scatter payload: exactly one chunk per rank.
pub fn check_scatter_chunks(chunks: &[Vec<f32>], world_size: usize) -> Result<()> {
    if chunks.len() != world_size {
        return Err(Error::Comm(format!(
            "scatter expects {world_size} chunks, got {}",
            chunks.len()
        )));
    }
    Ok(())
}

/// Single-rank group: every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoloComm;

impl Communicator for SoloComm {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn gather(&self, send: &[f32], root: usize) -> Result<Option<Vec<Vec<f32>>>> {
        check_root(root, 1)?;
        Ok(Some(vec![send.to_vec()]))
    }

    fn scatter(&self, send: Option<Vec<Vec<f32>>>, root: usize) -> Result<Vec<f32>> {
        check_root(root, 1)?;
        let chunks = send.ok_or_else(|| Error::Comm("root passed no scatter payload".into()))?;
        check_scatter_chunks(&chunks, 1)?;
        Ok(chunks.into_iter().next().unwrap_or_default())
    }

    fn all_reduce_max(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }
}
