// rust/ingest-core/src/lib.rs

//! Distributed Training Runtime - Dataset Ingest
//!
//! This crate shards named datasets across data-parallel training workers,
//! splitting or replicating each dataset per worker, and keeps the ingest
//! engine off the CPU and GPU capacity reserved for training.

pub mod config;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{IngestConfig, ScalingConfig};
pub use error::{IngestError, Result};

pub mod execution;
pub mod resources;
pub use execution::{DataContext, ExecutionOptions};
pub use resources::{ExecutionResources, ResourceReconciler};

pub mod split;
pub use split::DatasetsToSplit;

pub mod data_config;
pub use data_config::{
    validate_assignment, DataConfig, DataConfigSnapshot, DatasetCollection, DatasetShards,
    ShardingCoordinator, WorkerHandle,
};

pub mod dataset;
pub use dataset::{DataIterator, Dataset, DatasetRef, LocalDataset, LocalEngine, NodeId};

pub mod trainer;
pub use trainer::{DataParallelTrainer, RunResult, TrainContext, WorkerReport};
