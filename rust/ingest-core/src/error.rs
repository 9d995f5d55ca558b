// rust/ingest-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Dataset '{name}' error: {message}")]
    Dataset {
        name: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Shard {shard_id} out of range (total shards: {total_shards})")]
    InvalidShard {
        shard_id: usize,
        total_shards: usize,
    },

    #[error(
        "Insufficient {resource} for data execution: {available} usable after excluding {excluded}"
    )]
    ResourceExhausted {
        resource: &'static str,
        available: f64,
        excluded: f64,
    },

    #[error("Invalid shard assignment: {message}")]
    ShardShape {
        message: String,
    },

    #[error("Worker panicked: {message}")]
    WorkerPanicked {
        message: String,
    },

    #[error("Training run failed on worker {world_rank}")]
    TrainingFailed {
        world_rank: usize,
        #[source]
        source: Box<IngestError>,
    },
}

pub type Result<T> = std::result::Result<T, IngestError>;

// Convenience constructors
impl IngestError {

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataset {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn invalid_shard(shard_id: usize, total_shards: usize) -> Self {
        Self::InvalidShard { shard_id, total_shards }
    }

    pub fn resource_exhausted(resource: &'static str, available: f64, excluded: f64) -> Self {
        Self::ResourceExhausted {
            resource,
            available,
            excluded,
        }
    }

    pub fn shard_shape(message: impl Into<String>) -> Self {
        Self::ShardShape {
            message: message.into(),
        }
    }

    pub fn worker_panicked(message: impl Into<String>) -> Self {
        Self::WorkerPanicked {
            message: message.into(),
        }
    }

    pub fn training_failed(world_rank: usize, source: IngestError) -> Self {
        Self::TrainingFailed {
            world_rank,
            source: Box::new(source),
        }
    }

    /// Returns the innermost error, unwrapping `TrainingFailed` layers.
    pub fn root_cause(&self) -> &IngestError {
        match self {
            Self::TrainingFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
