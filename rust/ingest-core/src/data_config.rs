// rust/ingest-core/src/data_config.rs

//! Sharding of named datasets across training workers.
//!
//! Before any worker starts, a `ShardingCoordinator` turns a collection of
//! lazy datasets into one `DatasetShards` map per worker. `DataConfig` is
//! the default coordinator: datasets selected by `datasets_to_split` are
//! split into equal, disjoint streams (one per worker, placed near the
//! worker when locality is enabled); all other datasets are replicated so
//! every worker iterates the full dataset.
//!
//! Resources reserved for training are withheld from the ingest engine by
//! merging them into the execution options installed on every dataset copy.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::dataset::{DataIterator, DatasetRef, NodeId};
use crate::error::{IngestError, Result};
use crate::execution::{DataContext, ExecutionOptions};
use crate::resources::ExecutionResources;
use crate::split::DatasetsToSplit;

/// Datasets of one training run, keyed by name.
pub type DatasetCollection = BTreeMap<String, DatasetRef>;

/// Opaque reference to one training worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    run_id: Uuid,
    world_rank: usize,
}

impl WorkerHandle {
    pub fn new(run_id: Uuid, world_rank: usize) -> Self {
        Self { run_id, world_rank }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn world_rank(&self) -> usize {
        self.world_rank
    }
}

/// The iterators handed to one worker, keyed by dataset name.
#[derive(Default)]
pub struct DatasetShards {
    shards: BTreeMap<String, Box<dyn DataIterator>>,
}

impl DatasetShards {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, shard: Box<dyn DataIterator>) {
        self.shards.insert(name.into(), shard);
    }

    /// Returns the worker's iterator for `name`, or `None` if the run has no
    /// dataset by that name.
    pub fn get(&mut self, name: &str) -> Option<&mut dyn DataIterator> {
        let shard = self.shards.get_mut(name)?;
        Some(shard.as_mut())
    }

    /// Removes and returns the iterator for `name`.
    pub fn take(&mut self, name: &str) -> Option<Box<dyn DataIterator>> {
        self.shards.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shards.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.shards.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

impl fmt::Debug for DatasetShards {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetShards")
            .field("names", &self.shards.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Decides which iterator each worker receives for each dataset.
///
/// Implementations must return exactly `world_size` maps; element `i` goes
/// to the worker with world rank `i`. Every map must hold the same names.
pub trait ShardingCoordinator: Send + Sync {
    /// Builds the per-worker shard maps.
    ///
    /// `datasets` is never mutated. `worker_handles` and `worker_node_ids`
    /// both have `world_size` entries, in world rank order.
    fn configure(
        &self,
        datasets: &DatasetCollection,
        world_size: usize,
        worker_handles: &[WorkerHandle],
        worker_node_ids: &[NodeId],
    ) -> Result<Vec<DatasetShards>>;

    /// Receives the resources held by training before `configure` runs.
    fn set_train_total_resources(&mut self, _resources: &ExecutionResources) {}

    fn get_config(&self) -> Option<DataConfigSnapshot> {
        None
    }
}

/// Serializable view of a `DataConfig`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataConfigSnapshot {
    pub datasets_to_split: DatasetsToSplit,
    pub execution_options: ExecutionOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub train_total_resources: Option<ExecutionResources>,
}

/// Default sharding coordinator.
#[derive(Debug, Clone)]
pub struct DataConfig {
    datasets_to_split: DatasetsToSplit,
    execution_options: ExecutionOptions,
    train_total_resources: Option<ExecutionResources>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self::new(DatasetsToSplit::All, None)
    }
}

impl DataConfig {
    /// Creates a coordinator.
    ///
    /// Without explicit options the ingest defaults are snapshotted from the
    /// current data context now; later context changes do not apply.
    pub fn new(
        datasets_to_split: DatasetsToSplit,
        execution_options: Option<ExecutionOptions>,
    ) -> Self {
        Self {
            datasets_to_split,
            execution_options: execution_options.unwrap_or_else(Self::default_ingest_options),
            train_total_resources: None,
        }
    }

    /// Creates a coordinator from a loosely typed split specification.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `datasets_to_split` is `"all"`
    /// or an array of strings.
    pub fn from_value(
        datasets_to_split: &toml::Value,
        execution_options: Option<ExecutionOptions>,
    ) -> Result<Self> {
        let spec = DatasetsToSplit::from_value(datasets_to_split)?;
        Ok(Self::new(spec, execution_options))
    }

    /// Ingest defaults derived from the current process-wide data context.
    pub fn default_ingest_options() -> ExecutionOptions {
        Self::default_ingest_options_from(&DataContext::get_current())
    }

    pub fn default_ingest_options_from(ctx: &DataContext) -> ExecutionOptions {
        ExecutionOptions::ingest_defaults(ctx)
    }

    pub fn datasets_to_split(&self) -> &DatasetsToSplit {
        &self.datasets_to_split
    }

    /// Options as configured, without the training reservation.
    pub fn execution_options(&self) -> &ExecutionOptions {
        &self.execution_options
    }

    pub fn train_total_resources(&self) -> Option<&ExecutionResources> {
        self.train_total_resources.as_ref()
    }

    /// Options installed on dataset copies: the configured options with the
    /// training reservation added to the exclusion.
    pub fn effective_execution_options(&self) -> ExecutionOptions {
        match &self.train_total_resources {
            Some(total) => self.execution_options.with_excluded(total),
            None => self.execution_options.clone(),
        }
    }

    /// Locality hints passed to `streaming_split`.
    pub fn locality_hints<'a>(&self, worker_node_ids: &'a [NodeId]) -> Option<&'a [NodeId]> {
        if self.execution_options.locality_with_output {
            Some(worker_node_ids)
        } else {
            None
        }
    }

    fn check_topology(
        world_size: usize,
        worker_handles: &[WorkerHandle],
        worker_node_ids: &[NodeId],
    ) -> Result<()> {
        if world_size == 0 {
            return Err(IngestError::config("world_size must be greater than 0"));
        }
        if worker_handles.len() != world_size {
            return Err(IngestError::config(format!(
                "expected {} worker handles, got {}",
                world_size,
                worker_handles.len()
            )));
        }
        if worker_node_ids.len() != world_size {
            return Err(IngestError::config(format!(
                "expected {} worker node ids, got {}",
                world_size,
                worker_node_ids.len()
            )));
        }
        Ok(())
    }
}

impl ShardingCoordinator for DataConfig {
    fn configure(
        &self,
        datasets: &DatasetCollection,
        world_size: usize,
        worker_handles: &[WorkerHandle],
        worker_node_ids: &[NodeId],
    ) -> Result<Vec<DatasetShards>> {
        Self::check_topology(world_size, worker_handles, worker_node_ids)?;

        let options = self.effective_execution_options();
        let to_split = self.datasets_to_split.resolve(datasets.keys());
        let locality_hints = self.locality_hints(worker_node_ids);

        let mut assignment: Vec<DatasetShards> =
            (0..world_size).map(|_| DatasetShards::new()).collect();

        for (name, dataset) in datasets {
            let mut dataset = dataset.copy();
            dataset.set_execution_options(options.clone());

            let iterators = if to_split.contains(name) {
                let splits = dataset.streaming_split(world_size, true, locality_hints)?;
                if splits.len() != world_size {
                    return Err(IngestError::dataset(
                        name.as_str(),
                        format!(
                            "streaming_split returned {} iterators for {} workers",
                            splits.len(),
                            world_size
                        ),
                    ));
                }
                splits
            } else {
                (0..world_size).map(|_| dataset.iterator()).collect()
            };

            for (shards, iterator) in assignment.iter_mut().zip(iterators) {
                shards.insert(name.as_str(), iterator);
            }
        }

        tracing::info!(
            "Configured {} datasets for {} workers (split: {:?}, locality: {})",
            datasets.len(),
            world_size,
            to_split,
            locality_hints.is_some()
        );

        Ok(assignment)
    }

    fn set_train_total_resources(&mut self, resources: &ExecutionResources) {
        self.train_total_resources = Some(*resources);
    }

    fn get_config(&self) -> Option<DataConfigSnapshot> {
        Some(DataConfigSnapshot {
            datasets_to_split: self.datasets_to_split.clone(),
            execution_options: self.execution_options.clone(),
            train_total_resources: self.train_total_resources,
        })
    }
}

/// Checks a coordinator's output before it is handed to workers.
///
/// # Errors
///
/// Returns `ShardShape` if there is not one map per worker or the maps do
/// not all hold the same dataset names.
pub fn validate_assignment(assignment: &[DatasetShards], world_size: usize) -> Result<()> {
    if assignment.len() != world_size {
        return Err(IngestError::shard_shape(format!(
            "expected {} shard maps, got {}",
            world_size,
            assignment.len()
        )));
    }

    let Some(first) = assignment.first() else {
        return Ok(());
    };
    let expected: BTreeSet<&str> = first.names().collect();
    for (rank, shards) in assignment.iter().enumerate().skip(1) {
        let names: BTreeSet<&str> = shards.names().collect();
        if names != expected {
            return Err(IngestError::shard_shape(format!(
                "worker {} has datasets {:?}, worker 0 has {:?}",
                rank, names, expected
            )));
        }
    }
    Ok(())
}
