//! In-process data-parallel group for shardopt.
//!
//! Every rank is a thread and every ordered pair of ranks gets its own
//! channel, so messages between two ranks arrive in the order they were
//! sent. That is all the collectives need: every rank enters the same
//! collectives in the same order.
//!
//! If a rank fails and drops its [`LocalComm`], peers blocked on it see a
//! disconnected channel and fail with [`Error::Comm`] instead of hanging.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;

use shardopt::comm::{check_root, check_scatter_chunks};
use shardopt::{Communicator, Error, Result};
use tracing::{debug, trace};

/// One rank's endpoint of a [`LocalGroup`].
#[derive(Debug)]
pub struct LocalComm {
    rank: usize,
    world_size: usize,
    /// `to[dst]` sends to rank `dst`.
    to: Vec<Sender<Vec<f32>>>,
    /// `from[src]` receives from rank `src`.
    from: Vec<Mutex<Receiver<Vec<f32>>>>,
}

/// Builds the endpoints of an in-process group.
pub struct LocalGroup;

impl LocalGroup {
    /// One [`LocalComm`] per rank, indexed by rank.
    #[must_use]
    pub fn new(world_size: usize) -> Vec<LocalComm> {
        let mut to: Vec<Vec<Sender<Vec<f32>>>> = (0..world_size).map(|_| Vec::new()).collect();
        let mut from: Vec<Vec<Mutex<Receiver<Vec<f32>>>>> =
            (0..world_size).map(|_| Vec::new()).collect();
        for sends in &mut to {
            for recvs in &mut from {
                let (tx, rx) = channel();
                sends.push(tx);
                recvs.push(Mutex::new(rx));
            }
        }
        debug!(world_size, "built local communicator group");
        to.into_iter()
            .zip(from)
            .enumerate()
            .map(|(rank, (to, from))| LocalComm {
                rank,
                world_size,
                to,
                from,
            })
            .collect()
    }
}

impl LocalComm {
    fn send(&self, dst: usize, values: Vec<f32>) -> Result<()> {
        self.to[dst]
            .send(values)
            .map_err(|_| Error::Comm(format!("rank {} hung up on rank {}", dst, self.rank)))
    }

    fn recv(&self, src: usize) -> Result<Vec<f32>> {
        self.from[src]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv()
            .map_err(|_| Error::Comm(format!("rank {} hung up on rank {}", src, self.rank)))
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn gather(&self, send: &[f32], root: usize) -> Result<Option<Vec<Vec<f32>>>> {
        check_root(root, self.world_size)?;
        trace!(rank = self.rank, root, numel = send.len(), "gather");
        if self.rank != root {
            self.send(root, send.to_vec())?;
            return Ok(None);
        }
        (0..self.world_size)
            .map(|src| {
                if src == root {
                    Ok(send.to_vec())
                } else {
                    self.recv(src)
                }
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    fn scatter(&self, send: Option<Vec<Vec<f32>>>, root: usize) -> Result<Vec<f32>> {
        check_root(root, self.world_size)?;
        trace!(rank = self.rank, root, "scatter");
        if self.rank != root {
            return self.recv(root);
        }
        let chunks = send.ok_or_else(|| Error::Comm("root passed no scatter payload".into()))?;
        check_scatter_chunks(&chunks, self.world_size)?;
        let mut own = Vec::new();
        for (dst, chunk) in chunks.into_iter().enumerate() {
            if dst == root {
                own = chunk;
            } else {
                self.send(dst, chunk)?;
            }
        }
        Ok(own)
    }

    fn all_reduce_max(&self, values: &mut [f32]) -> Result<()> {
        let root = self.root();
        let reduced = match self.gather(values, root)? {
            Some(chunks) => {
                let mut max = values.to_vec();
                for chunk in &chunks {
                    if chunk.len() != max.len() {
                        return Err(Error::Comm(format!(
                            "all_reduce_max over {} values got {} from a peer",
                            max.len(),
                            chunk.len()
                        )));
                    }
                    for (m, v) in max.iter_mut().zip(chunk) {
                        *m = m.max(*v);
                    }
                }
                self.scatter(Some(vec![max; self.world_size]), root)?
            }
            None => self.scatter(None, root)?,
        };
        if reduced.len() != values.len() {
            return Err(Error::Comm(format!(
                "all_reduce_max expected {} values, got {}",
                values.len(),
                reduced.len()
            )));
        }
        values.copy_from_slice(&reduced);
        Ok(())
    }
}

/// Run `f` once per rank of a fresh `world_size` group, each on its own
/// thread, and return the per-rank results in rank order.
///
/// # Panics
/// Panics if a rank thread panics.
pub fn run_ranks<T, F>(world_size: usize, f: F) -> Vec<Result<T>>
where
    T: Send,
    F: Fn(LocalComm) -> Result<T> + Sync,
{
    let comms = LocalGroup::new(world_size);
    thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = &f;
                s.spawn(move || f(comm))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}
