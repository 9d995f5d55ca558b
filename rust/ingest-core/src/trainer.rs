// rust/ingest-core/src/trainer.rs

//! Minimal data-parallel training driver.
//!
//! `DataParallelTrainer` reserves training resources, asks its sharding
//! coordinator for one shard map per worker, then runs the user train loop
//! once per worker on its own thread. Any worker failure fails the run.

use std::any::Any;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::ScalingConfig;
use crate::data_config::{
    validate_assignment, DataConfig, DataConfigSnapshot, DatasetCollection, DatasetShards,
    ShardingCoordinator, WorkerHandle,
};
use crate::dataset::{DataIterator, DatasetRef, NodeId, LOCAL_NODE_ID};
use crate::error::{IngestError, Result};
use crate::resources::ResourceReconciler;

type TrainLoop = Box<dyn Fn(&mut TrainContext) -> Result<()> + Send + Sync>;

/// Per-worker state passed to the train loop.
#[derive(Debug)]
pub struct TrainContext {
    world_rank: usize,
    world_size: usize,
    node_id: NodeId,
    shards: DatasetShards,
}

impl TrainContext {
    pub fn world_rank(&self) -> usize {
        self.world_rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// This worker's iterator for `name`, or `None` if the run has no such dataset.
    pub fn get_dataset_shard(&mut self, name: &str) -> Option<&mut dyn DataIterator> {
        self.shards.get(name)
    }
}

/// What one worker did during a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub world_rank: usize,
    pub node_id: NodeId,
    pub elapsed: Duration,
}

/// Outcome of a successful `fit`.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: Uuid,
    pub world_size: usize,
    pub elapsed: Duration,
    /// One report per worker, in world rank order.
    pub workers: Vec<WorkerReport>,
}

pub struct DataParallelTrainer {
    train_loop: TrainLoop,
    scaling: ScalingConfig,
    datasets: DatasetCollection,
    coordinator: Box<dyn ShardingCoordinator>,
    worker_node_ids: Option<Vec<NodeId>>,
    reconciler: ResourceReconciler,
}

impl DataParallelTrainer {
    /// Creates a trainer that splits every dataset with the default `DataConfig`.
    pub fn new<F>(train_loop: F, scaling: ScalingConfig) -> Self
    where
        F: Fn(&mut TrainContext) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            train_loop: Box::new(train_loop),
            scaling,
            datasets: DatasetCollection::new(),
            coordinator: Box::new(DataConfig::default()),
            worker_node_ids: None,
            reconciler: ResourceReconciler::default(),
        }
    }

    #[must_use]
    pub fn with_dataset(mut self, name: impl Into<String>, dataset: DatasetRef) -> Self {
        self.datasets.insert(name.into(), dataset);
        self
    }

    #[must_use]
    pub fn with_datasets(mut self, datasets: DatasetCollection) -> Self {
        self.datasets.extend(datasets);
        self
    }

    /// Replaces the sharding coordinator.
    #[must_use]
    pub fn with_dataset_config(mut self, coordinator: impl ShardingCoordinator + 'static) -> Self {
        self.coordinator = Box::new(coordinator);
        self
    }

    /// Places workers on the given nodes, one id per world rank. Workers run
    /// on `LOCAL_NODE_ID` otherwise.
    #[must_use]
    pub fn with_worker_node_ids(mut self, node_ids: Vec<NodeId>) -> Self {
        self.worker_node_ids = Some(node_ids);
        self
    }

    #[must_use]
    pub fn with_reconciler(mut self, reconciler: ResourceReconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn get_dataset_config(&self) -> Option<DataConfigSnapshot> {
        self.coordinator.get_config()
    }

    fn node_ids(&self, world_size: usize) -> Result<Vec<NodeId>> {
        match &self.worker_node_ids {
            Some(ids) if ids.len() != world_size => Err(IngestError::config(format!(
                "expected {} worker node ids, got {}",
                world_size,
                ids.len()
            ))),
            Some(ids) => Ok(ids.clone()),
            None => Ok(vec![LOCAL_NODE_ID.to_string(); world_size]),
        }
    }

    /// Runs the train loop on every worker.
    ///
    /// # Errors
    ///
    /// Configuration and sharding errors are returned before any worker
    /// starts. A failure inside a worker is returned as `TrainingFailed`
    /// for the lowest failing world rank.
    pub fn fit(&mut self) -> Result<RunResult> {
        self.scaling.validate()?;

        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let world_size = self.scaling.num_workers;

        let train_total = self.reconciler.train_total_resources(&self.scaling);
        self.coordinator.set_train_total_resources(&train_total);

        let worker_handles: Vec<WorkerHandle> = (0..world_size)
            .map(|rank| WorkerHandle::new(run_id, rank))
            .collect();
        let node_ids = self.node_ids(world_size)?;

        let assignment =
            self.coordinator
                .configure(&self.datasets, world_size, &worker_handles, &node_ids)?;
        validate_assignment(&assignment, world_size)?;

        tracing::info!(
            "Starting run {} with {} workers and {} datasets",
            run_id,
            world_size,
            self.datasets.len()
        );

        let contexts: Vec<TrainContext> = assignment
            .into_iter()
            .zip(node_ids)
            .enumerate()
            .map(|(world_rank, (shards, node_id))| TrainContext {
                world_rank,
                world_size,
                node_id,
                shards,
            })
            .collect();

        let outcomes = run_workers(&*self.train_loop, contexts)?;

        let mut workers = Vec::with_capacity(world_size);
        for (world_rank, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(report) => workers.push(report),
                Err(e) => {
                    tracing::error!("Worker {} of run {} failed: {}", world_rank, run_id, e);
                    return Err(IngestError::training_failed(world_rank, e));
                }
            }
        }

        let elapsed = started.elapsed();
        tracing::info!("Run {} finished in {:?}", run_id, elapsed);

        Ok(RunResult {
            run_id,
            world_size,
            elapsed,
            workers,
        })
    }
}

fn run_workers(
    train_loop: &(dyn Fn(&mut TrainContext) -> Result<()> + Send + Sync),
    contexts: Vec<TrainContext>,
) -> Result<Vec<Result<WorkerReport>>> {
    crossbeam::thread::scope(|scope| {
        let handles: Vec<_> = contexts
            .into_iter()
            .map(|mut ctx| {
                scope.spawn(move |_| -> Result<WorkerReport> {
                    let started = Instant::now();
                    train_loop(&mut ctx)?;
                    Ok(WorkerReport {
                        world_rank: ctx.world_rank,
                        node_id: ctx.node_id,
                        elapsed: started.elapsed(),
                    })
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|panic| {
                    Err(IngestError::worker_panicked(panic_message(&*panic)))
                })
            })
            .collect()
    })
    .map_err(|panic| IngestError::worker_panicked(panic_message(&*panic)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
