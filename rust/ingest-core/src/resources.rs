// rust/ingest-core/src/resources.rs

//! Resource accounting shared by the ingest engine and the training workers.
//!
//! Training workers reserve CPU and GPU capacity up front. The ingest engine
//! must not compete for that capacity, so the reserved amounts are excluded
//! from the engine's execution budget before any dataset executes.

use serde::{Deserialize, Serialize};

use crate::config::ScalingConfig;

/// Resource key used for CPUs in per-worker resource maps.
pub const CPU: &str = "CPU";
/// Resource key used for GPUs in per-worker resource maps.
pub const GPU: &str = "GPU";

/// CPUs held by the trainer actor when the scaling config does not say otherwise.
pub const DEFAULT_TRAINER_CPU: f64 = 1.0;
/// GPUs held by the trainer actor when the scaling config does not say otherwise.
pub const DEFAULT_TRAINER_GPU: f64 = 0.0;

/// Named resource capacities.
///
/// A `None` field means "unspecified": unlimited when used as a limit and
/// zero when used as an exclusion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_store_memory: Option<f64>,
}

impl ExecutionResources {
    /// Creates resources with explicit CPU and GPU amounts.
    pub fn new(cpu: f64, gpu: f64) -> Self {
        Self {
            cpu: Some(cpu),
            gpu: Some(gpu),
            object_store_memory: None,
        }
    }

    /// Resources with every kind set to zero.
    pub fn zero() -> Self {
        Self {
            cpu: Some(0.0),
            gpu: Some(0.0),
            object_store_memory: Some(0.0),
        }
    }

    /// Adds two resource sets, treating unspecified kinds as zero.
    #[must_use]
    pub fn add(&self, other: &ExecutionResources) -> Self {
        Self {
            cpu: Some(self.cpu.unwrap_or(0.0) + other.cpu.unwrap_or(0.0)),
            gpu: Some(self.gpu.unwrap_or(0.0) + other.gpu.unwrap_or(0.0)),
            object_store_memory: Some(
                self.object_store_memory.unwrap_or(0.0)
                    + other.object_store_memory.unwrap_or(0.0),
            ),
        }
    }

    /// Returns true if every specified kind is zero.
    pub fn is_zero(&self) -> bool {
        [self.cpu, self.gpu, self.object_store_memory]
            .iter()
            .all(|v| v.unwrap_or(0.0) == 0.0)
    }

    /// Checks that no specified kind is negative or non-finite.
    pub fn is_valid(&self) -> bool {
        [self.cpu, self.gpu, self.object_store_memory]
            .iter()
            .flatten()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Computes how much capacity to withhold from the ingest engine.
///
/// The exclusion is the sum of the training workers' reservations, the
/// trainer actor's reservation and whatever baseline the caller already
/// excluded on its own execution options.
#[derive(Debug, Clone, Copy)]
pub struct ResourceReconciler {
    trainer_cpu: f64,
    trainer_gpu: f64,
}

impl Default for ResourceReconciler {
    fn default() -> Self {
        Self {
            trainer_cpu: DEFAULT_TRAINER_CPU,
            trainer_gpu: DEFAULT_TRAINER_GPU,
        }
    }
}

impl ResourceReconciler {
    /// Creates a reconciler with custom trainer-actor defaults.
    pub fn with_trainer_defaults(trainer_cpu: f64, trainer_gpu: f64) -> Self {
        Self {
            trainer_cpu,
            trainer_gpu,
        }
    }

    /// Total resources held by training: all workers plus the trainer actor.
    pub fn train_total_resources(&self, scaling: &ScalingConfig) -> ExecutionResources {
        let workers = scaling.num_workers as f64;
        let trainer_cpu = scaling.trainer_resource(CPU).unwrap_or(self.trainer_cpu);
        let trainer_gpu = scaling.trainer_resource(GPU).unwrap_or(self.trainer_gpu);

        ExecutionResources::new(
            workers * scaling.cpu_per_worker() + trainer_cpu,
            workers * scaling.gpu_per_worker() + trainer_gpu,
        )
    }

    /// Exclusion to install on the ingest engine for a training run.
    pub fn compute_exclusion(
        &self,
        scaling: &ScalingConfig,
        baseline: &ExecutionResources,
    ) -> ExecutionResources {
        let exclusion = self.train_total_resources(scaling).add(baseline);
        tracing::debug!(
            "Excluding cpu={:?} gpu={:?} from data execution ({} workers)",
            exclusion.cpu,
            exclusion.gpu,
            scaling.num_workers
        );
        exclusion
    }
}
