// rust/ingest-core/src/execution.rs

//! Execution options consumed by the ingest engine.
//!
//! `DataContext` is the process-wide default the engine starts from. Ingest
//! options are always taken as a snapshot of it: a context change after the
//! snapshot never leaks into options that were already built.

use std::sync::{OnceLock, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};
use crate::resources::ExecutionResources;

/// Tuning knobs for one dataset execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Upper bound on what the engine may use. Unspecified kinds are unlimited.
    pub resource_limits: ExecutionResources,
    /// Capacity that is never available to the engine.
    pub exclude_resources: ExecutionResources,
    /// Prefer placing output blocks on the node that consumes them.
    pub locality_with_output: bool,
    /// Keep block order deterministic across execution.
    ///
    /// `LocalEngine` executes blocks one at a time in plan order, so its
    /// output order never depends on this flag. Random ops stay random.
    pub preserve_order: bool,
    /// Report progress at info level instead of debug.
    pub verbose_progress: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            resource_limits: ExecutionResources::default(),
            exclude_resources: ExecutionResources::zero(),
            locality_with_output: false,
            preserve_order: false,
            verbose_progress: false,
        }
    }
}

impl ExecutionOptions {
    /// Options used for training ingest, derived from `ctx` at call time.
    ///
    /// Locality with output is enabled; ordering, progress and limits are
    /// copied from the context. The exclusion starts from zero.
    pub fn ingest_defaults(ctx: &DataContext) -> Self {
        Self {
            resource_limits: ctx.execution_options.resource_limits,
            exclude_resources: ExecutionResources::zero(),
            locality_with_output: true,
            preserve_order: ctx.execution_options.preserve_order,
            verbose_progress: ctx.execution_options.verbose_progress,
        }
    }

    /// Returns a copy with `extra` added to the excluded resources.
    #[must_use]
    pub fn with_excluded(&self, extra: &ExecutionResources) -> Self {
        Self {
            exclude_resources: self.exclude_resources.add(extra),
            ..self.clone()
        }
    }

    /// Computes the capacity left to the engine on a cluster of `cluster` size.
    ///
    /// CPU is required: if none is left after exclusions and limits the
    /// execution cannot start. GPU and object store memory are clamped at zero.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if no CPU is usable.
    pub fn usable_resources(&self, cluster: &ExecutionResources) -> Result<ExecutionResources> {
        let excluded_cpu = self.exclude_resources.cpu.unwrap_or(0.0);
        let mut cpu = cluster.cpu.unwrap_or(0.0) - excluded_cpu;
        if let Some(limit) = self.resource_limits.cpu {
            cpu = cpu.min(limit);
        }
        if cpu <= 0.0 {
            return Err(IngestError::resource_exhausted("CPU", cpu, excluded_cpu));
        }

        let mut gpu = cluster.gpu.unwrap_or(0.0) - self.exclude_resources.gpu.unwrap_or(0.0);
        if let Some(limit) = self.resource_limits.gpu {
            gpu = gpu.min(limit);
        }

        let object_store_memory = cluster.object_store_memory.map(|total| {
            let mut memory = total - self.exclude_resources.object_store_memory.unwrap_or(0.0);
            if let Some(limit) = self.resource_limits.object_store_memory {
                memory = memory.min(limit);
            }
            memory.max(0.0)
        });

        Ok(ExecutionResources {
            cpu: Some(cpu),
            gpu: Some(gpu.max(0.0)),
            object_store_memory,
        })
    }
}

/// Process-wide dataset execution defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataContext {
    pub execution_options: ExecutionOptions,
}

fn current_context() -> &'static RwLock<DataContext> {
    static CURRENT: OnceLock<RwLock<DataContext>> = OnceLock::new();
    CURRENT.get_or_init(|| RwLock::new(DataContext::default()))
}

impl DataContext {
    /// Returns a snapshot of the current process-wide context.
    pub fn get_current() -> DataContext {
        current_context()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the process-wide context.
    pub fn set_current(ctx: DataContext) {
        *current_context()
            .write()
            .unwrap_or_else(PoisonError::into_inner) = ctx;
    }

    /// Mutates the process-wide context in place.
    pub fn update_current(f: impl FnOnce(&mut DataContext)) {
        let mut guard = current_context()
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = ExecutionOptions::default();
        assert!(!options.locality_with_output);
        assert!(!options.preserve_order);
        assert!(!options.verbose_progress);
        assert!(options.exclude_resources.is_zero());
        assert!(options.resource_limits.cpu.is_none());
    }

    #[test]
    fn test_ingest_defaults_copy_context() {
        let mut ctx = DataContext::default();
        ctx.execution_options.preserve_order = true;
        ctx.execution_options.verbose_progress = true;
        ctx.execution_options.resource_limits.cpu = Some(3.0);
        ctx.execution_options.exclude_resources.cpu = Some(5.0);

        let options = ExecutionOptions::ingest_defaults(&ctx);
        assert!(options.preserve_order);
        assert!(options.verbose_progress);
        assert!(options.locality_with_output);
        assert_eq!(options.resource_limits.cpu, Some(3.0));
        // Exclusions are not inherited from the context
        assert!(options.exclude_resources.is_zero());
    }

    #[test]
    fn test_ingest_defaults_are_a_snapshot() {
        let mut ctx = DataContext::default();
        let options = ExecutionOptions::ingest_defaults(&ctx);

        ctx.execution_options.preserve_order = true;
        ctx.execution_options.verbose_progress = true;

        assert!(!options.preserve_order);
        assert!(!options.verbose_progress);
        assert!(ExecutionOptions::ingest_defaults(&ctx).preserve_order);
    }

    #[test]
    fn test_with_excluded_is_additive() {
        let mut options = ExecutionOptions::default();
        options.exclude_resources.cpu = Some(2.0);
        options.exclude_resources.gpu = Some(1.0);

        let merged = options.with_excluded(&ExecutionResources::new(5.0, 2.0));
        assert_eq!(merged.exclude_resources.cpu, Some(7.0));
        assert_eq!(merged.exclude_resources.gpu, Some(3.0));
        // Original untouched
        assert_eq!(options.exclude_resources.cpu, Some(2.0));
    }

    #[test]
    fn test_usable_resources() {
        let mut options = ExecutionOptions::default();
        options.exclude_resources = ExecutionResources::new(3.0, 1.0);

        let usable = options
            .usable_resources(&ExecutionResources::new(8.0, 2.0))
            .unwrap();
        assert_eq!(usable.cpu, Some(5.0));
        assert_eq!(usable.gpu, Some(1.0));

        options.resource_limits.cpu = Some(2.0);
        let usable = options
            .usable_resources(&ExecutionResources::new(8.0, 2.0))
            .unwrap();
        assert_eq!(usable.cpu, Some(2.0));
    }

    #[test]
    fn test_usable_resources_zero_cpu_limit_fails() {
        let mut options = ExecutionOptions::default();
        options.resource_limits.cpu = Some(0.0);

        let result = options.usable_resources(&ExecutionResources::new(4.0, 0.0));
        assert!(matches!(
            result,
            Err(IngestError::ResourceExhausted { resource: "CPU", .. })
        ));
    }

    #[test]
    fn test_usable_resources_fully_excluded_fails() {
        let options = ExecutionOptions::default().with_excluded(&ExecutionResources::new(4.0, 0.0));
        let result = options.usable_resources(&ExecutionResources::new(4.0, 0.0));
        assert!(result.is_err());
    }

    #[test]
    fn test_gpu_is_clamped_not_required() {
        let options = ExecutionOptions::default().with_excluded(&ExecutionResources::new(1.0, 4.0));
        let usable = options
            .usable_resources(&ExecutionResources::new(4.0, 1.0))
            .unwrap();
        assert_eq!(usable.gpu, Some(0.0));
    }
}
