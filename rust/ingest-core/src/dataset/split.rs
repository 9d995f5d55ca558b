// rust/ingest-core/src/dataset/split.rs

//! Streaming split of one dataset into per-worker partitions.
//!
//! All split iterators of one dataset share a coordinator. The first
//! iterator to start an epoch executes the plan for everyone; the output is
//! partitioned once and each iterator takes its own partition. This keeps
//! the partitions of an epoch disjoint even when the plan is random.
//!
//! A split may run at most one epoch ahead of the slowest split. A split
//! that gets further ahead waits for the others and fails if they do not
//! catch up in time, so at most two epochs are ever buffered.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{IngestError, Result};
use crate::execution::ExecutionOptions;

use super::local::LocalDataset;
use super::traits::{Block, DataIterator, Dataset, NodeId, Row};

/// Epochs a split may start before the slowest split finishes its current one.
const MAX_EPOCHS_AHEAD: u64 = 1;

/// How long a split that ran ahead waits for the others before failing.
const RUN_AHEAD_WAIT: Duration = Duration::from_secs(300);

/// Partitions of one epoch that have not been taken yet.
struct EpochOutput {
    partitions: Vec<Option<Vec<Row>>>,
    remaining: usize,
}

struct SplitState {
    epochs: HashMap<u64, EpochOutput>,
    /// Next epoch each split will take.
    next_epoch: Vec<u64>,
}

impl SplitState {
    fn slowest(&self) -> u64 {
        self.next_epoch.iter().copied().min().unwrap_or(0)
    }

    fn too_far_ahead(&self, split_index: usize) -> bool {
        self.next_epoch[split_index] > self.slowest() + MAX_EPOCHS_AHEAD
    }
}

pub(crate) struct SplitCoordinator {
    dataset: LocalDataset,
    num_splits: usize,
    equal: bool,
    locality_hints: Option<Vec<NodeId>>,
    state: Mutex<SplitState>,
    caught_up: Condvar,
    run_ahead_wait: Duration,
}

impl std::fmt::Debug for SplitCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitCoordinator")
            .field("num_splits", &self.num_splits)
            .field("equal", &self.equal)
            .field("locality_hints", &self.locality_hints)
            .finish()
    }
}

impl SplitCoordinator {
    /// Creates `num_splits` iterators sharing one coordinator.
    pub(crate) fn start(
        dataset: LocalDataset,
        num_splits: usize,
        equal: bool,
        locality_hints: Option<&[NodeId]>,
    ) -> Result<Vec<Box<dyn DataIterator>>> {
        let coordinator = Self::new(dataset, num_splits, equal, locality_hints, RUN_AHEAD_WAIT)?;
        Ok(Self::iterators(&coordinator))
    }

    fn new(
        dataset: LocalDataset,
        num_splits: usize,
        equal: bool,
        locality_hints: Option<&[NodeId]>,
        run_ahead_wait: Duration,
    ) -> Result<Arc<Self>> {
        if num_splits == 0 {
            return Err(IngestError::config(
                "streaming_split requires at least one split",
            ));
        }
        if let Some(hints) = locality_hints {
            if hints.len() != num_splits {
                return Err(IngestError::config(format!(
                    "expected {} locality hints, got {}",
                    num_splits,
                    hints.len()
                )));
            }
        }

        Ok(Arc::new(Self {
            dataset,
            num_splits,
            equal,
            locality_hints: locality_hints.map(<[NodeId]>::to_vec),
            state: Mutex::new(SplitState {
                epochs: HashMap::new(),
                next_epoch: vec![0; num_splits],
            }),
            caught_up: Condvar::new(),
            run_ahead_wait,
        }))
    }

    fn iterators(coordinator: &Arc<Self>) -> Vec<Box<dyn DataIterator>> {
        (0..coordinator.num_splits)
            .map(|split_index| {
                Box::new(SplitIterator {
                    coordinator: coordinator.clone(),
                    split_index,
                    epoch: 0,
                }) as Box<dyn DataIterator>
            })
            .collect()
    }

    fn run_epoch(&self, epoch: u64) -> Result<EpochOutput> {
        let blocks = self.dataset.execute()?;
        let partitions = assign_blocks(
            blocks,
            self.num_splits,
            self.equal,
            self.locality_hints.as_deref(),
        );
        tracing::debug!(
            "Split epoch {} into {} partitions: {:?} rows",
            epoch,
            self.num_splits,
            partitions
                .iter()
                .map(|p| p.iter().map(Block::len).sum::<usize>())
                .collect::<Vec<_>>()
        );

        Ok(EpochOutput {
            partitions: partitions
                .into_iter()
                .map(|blocks| Some(blocks.into_iter().flat_map(|b| b.rows).collect()))
                .collect(),
            remaining: self.num_splits,
        })
    }

    /// Takes the next epoch's partition of `split_index`.
    ///
    /// Waits while this split is more than one epoch ahead of the slowest
    /// split and fails once `run_ahead_wait` has passed.
    fn take(&self, split_index: usize) -> Result<Vec<Row>> {
        if split_index >= self.num_splits {
            return Err(IngestError::invalid_shard(split_index, self.num_splits));
        }

        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut state, _) = self
            .caught_up
            .wait_timeout_while(state, self.run_ahead_wait, |state| {
                state.too_far_ahead(split_index)
            })
            .unwrap_or_else(PoisonError::into_inner);

        let epoch = state.next_epoch[split_index];
        if state.too_far_ahead(split_index) {
            tracing::warn!(
                "Split {} waited {:?} at epoch {} for the slowest split at epoch {}",
                split_index,
                self.run_ahead_wait,
                epoch,
                state.slowest()
            );
            return Err(IngestError::dataset(
                "streaming_split",
                format!(
                    "split {} cannot start epoch {} while the slowest split is at epoch {}",
                    split_index,
                    epoch,
                    state.slowest()
                ),
            ));
        }

        let (rows, done) = {
            let output = match state.epochs.entry(epoch) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.run_epoch(epoch)?),
            };
            let rows = output.partitions[split_index]
                .take()
                .ok_or_else(|| IngestError::invalid_shard(split_index, self.num_splits))?;
            output.remaining -= 1;
            (rows, output.remaining == 0)
        };

        if done {
            state.epochs.remove(&epoch);
        }
        state.next_epoch[split_index] += 1;
        drop(state);
        self.caught_up.notify_all();

        Ok(rows)
    }

    #[cfg(test)]
    fn buffered_epochs(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epochs
            .len()
    }

    #[cfg(test)]
    fn buffered_rows(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .epochs
            .values()
            .flat_map(|output| output.partitions.iter().flatten())
            .map(Vec::len)
            .sum()
    }
}

/// One worker's view of a split dataset.
#[derive(Debug)]
pub struct SplitIterator {
    coordinator: Arc<SplitCoordinator>,
    split_index: usize,
    epoch: u64,
}

impl SplitIterator {
    pub fn split_index(&self) -> usize {
        self.split_index
    }
}

impl DataIterator for SplitIterator {
    fn iter_rows(&mut self) -> Result<Vec<Row>> {
        let rows = self.coordinator.take(self.split_index)?;
        self.epoch += 1;
        Ok(rows)
    }

    fn execution_options(&self) -> &ExecutionOptions {
        self.coordinator.dataset.execution_options()
    }

    fn epochs_completed(&self) -> u64 {
        self.epoch
    }
}

/// Rows `start..end` of the `block_index`-th executed block.
#[derive(Debug, Clone, Copy)]
struct Piece {
    block_index: usize,
    start: usize,
    end: usize,
}

impl Piece {
    fn whole(block_index: usize, block: &Block) -> Self {
        Self {
            block_index,
            start: 0,
            end: block.len(),
        }
    }
}

/// Partitions executed blocks across `num_splits` splits.
///
/// Locality first: a block goes to a split whose hint names the block's
/// node, as long as that split has room. Remaining blocks fill the splits in
/// order. With `equal` blocks are sliced so split sizes differ by at most one
/// row; otherwise whole blocks are assigned.
pub(crate) fn assign_blocks(
    blocks: Vec<Block>,
    num_splits: usize,
    equal: bool,
    locality_hints: Option<&[NodeId]>,
) -> Vec<Vec<Block>> {
    let pieces = if equal {
        assign_equal(&blocks, num_splits, locality_hints)
    } else {
        assign_whole(&blocks, num_splits, locality_hints)
    };

    pieces
        .into_iter()
        .map(|mut pieces| {
            // Keep execution order within a split
            pieces.sort_by_key(|p| (p.block_index, p.start));
            pieces
                .into_iter()
                .map(|p| {
                    let block = &blocks[p.block_index];
                    Block::new(block.rows[p.start..p.end].to_vec(), block.node_id.clone())
                })
                .collect()
        })
        .collect()
}

/// Split co-located with `block` that passes `fits`, preferring the least loaded.
fn local_split(
    locality_hints: Option<&[NodeId]>,
    block: &Block,
    fits: impl Fn(usize) -> bool,
    load: impl Fn(usize) -> usize,
) -> Option<usize> {
    let hints = locality_hints?;
    let node = block.node_id.as_ref()?;
    hints
        .iter()
        .enumerate()
        .filter(|(j, hint)| *hint == node && fits(*j))
        .map(|(j, _)| j)
        .min_by_key(|j| (load(*j), *j))
}

fn assign_equal(
    blocks: &[Block],
    num_splits: usize,
    locality_hints: Option<&[NodeId]>,
) -> Vec<Vec<Piece>> {
    let total: usize = blocks.iter().map(Block::len).sum();
    let per_split = total / num_splits;
    let remainder = total % num_splits;
    let targets: Vec<usize> = (0..num_splits)
        .map(|i| per_split + usize::from(i < remainder))
        .collect();

    let mut capacity = targets.clone();
    let mut assignments: Vec<Vec<Piece>> = vec![Vec::new(); num_splits];
    let mut leftover = Vec::new();

    // First pass: whole blocks to co-located splits with room
    for (index, block) in blocks.iter().enumerate() {
        if block.is_empty() {
            continue;
        }
        let local = local_split(
            locality_hints,
            block,
            |j| capacity[j] >= block.len(),
            |j| targets[j] - capacity[j],
        );
        match local {
            Some(j) => {
                assignments[j].push(Piece::whole(index, block));
                capacity[j] -= block.len();
            }
            None => leftover.push(index),
        }
    }

    // Second pass: fill splits in order, slicing blocks at capacity
    let mut target = 0;
    for index in leftover {
        let block = &blocks[index];
        let mut start = 0;
        while start < block.len() {
            while target < num_splits && capacity[target] == 0 {
                target += 1;
            }
            if target == num_splits {
                break;
            }
            let take = capacity[target].min(block.len() - start);
            assignments[target].push(Piece {
                block_index: index,
                start,
                end: start + take,
            });
            capacity[target] -= take;
            start += take;
        }
    }

    assignments
}

fn assign_whole(
    blocks: &[Block],
    num_splits: usize,
    locality_hints: Option<&[NodeId]>,
) -> Vec<Vec<Piece>> {
    let mut assignments: Vec<Vec<Piece>> = vec![Vec::new(); num_splits];

    if locality_hints.is_none() {
        // Contiguous runs of blocks; earlier splits take the remainder
        let per_split = blocks.len() / num_splits;
        let remainder = blocks.len() % num_splits;
        let mut start = 0;
        for (i, assignment) in assignments.iter_mut().enumerate() {
            let count = per_split + usize::from(i < remainder);
            for index in start..start + count {
                assignment.push(Piece::whole(index, &blocks[index]));
            }
            start += count;
        }
        return assignments;
    }

    let max_blocks = blocks.len().div_ceil(num_splits).max(1);
    let mut rows = vec![0usize; num_splits];
    let mut leftover = Vec::new();

    for (index, block) in blocks.iter().enumerate() {
        let local = local_split(
            locality_hints,
            block,
            |j| assignments[j].len() < max_blocks,
            |j| rows[j],
        );
        match local {
            Some(j) => {
                assignments[j].push(Piece::whole(index, block));
                rows[j] += block.len();
            }
            None => leftover.push(index),
        }
    }

    for index in leftover {
        let j = (0..num_splits).min_by_key(|j| (rows[*j], *j)).unwrap_or(0);
        assignments[j].push(Piece::whole(index, &blocks[index]));
        rows[j] += blocks[index].len();
    }

    assignments
}
