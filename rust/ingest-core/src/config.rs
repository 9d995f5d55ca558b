// rust/ingest-core/src/config.rs

//! Configuration management for dataset ingest.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use crate::data_config::DataConfig;
use crate::error::{IngestError, Result};
use crate::execution::ExecutionOptions;
use crate::resources::{ExecutionResources, ResourceReconciler, CPU, GPU};
use crate::split::DatasetsToSplit;

// Top-level ingest configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub data: DataSettings,
    pub scaling: ScalingConfig,
}

/// How datasets are handed to training workers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSettings {
    /// "all" or a list of dataset names to split across workers.
    pub datasets_to_split: DatasetsToSplit,
    /// Execution options for the ingest engine. When absent, the ingest
    /// defaults are taken from the current data context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOptions>,
}

/// Shape of the training worker group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    // Number of training workers.
    pub num_workers: usize,
    // Whether each worker reserves a GPU by default.
    pub use_gpu: bool,
    /// Resources reserved by each worker, keyed by "CPU", "GPU", ...
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources_per_worker: Option<BTreeMap<String, f64>>,
    /// Resources reserved by the trainer actor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trainer_resources: Option<BTreeMap<String, f64>>,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            use_gpu: false,
            resources_per_worker: None,
            trainer_resources: None,
        }
    }
}

impl ScalingConfig {
    /// CPUs reserved per worker; one unless configured.
    pub fn cpu_per_worker(&self) -> f64 {
        self.worker_resource(CPU).unwrap_or(1.0)
    }

    /// GPUs reserved per worker; one when `use_gpu` is set, otherwise zero,
    /// unless configured.
    pub fn gpu_per_worker(&self) -> f64 {
        self.worker_resource(GPU)
            .unwrap_or(if self.use_gpu { 1.0 } else { 0.0 })
    }

    pub fn worker_resource(&self, name: &str) -> Option<f64> {
        self.resources_per_worker.as_ref()?.get(name).copied()
    }

    pub fn trainer_resource(&self, name: &str) -> Option<f64> {
        self.trainer_resources.as_ref()?.get(name).copied()
    }

    /// Validate scaling configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(IngestError::config(
                "scaling.num_workers must be greater than 0",
            ));
        }
        for (section, resources) in [
            ("resources_per_worker", &self.resources_per_worker),
            ("trainer_resources", &self.trainer_resources),
        ] {
            for (name, amount) in resources.iter().flatten() {
                if !amount.is_finite() || *amount < 0.0 {
                    return Err(IngestError::config(format!(
                        "scaling.{}.{} must be a non-negative number",
                        section, name
                    )));
                }
            }
        }
        Ok(())
    }
}

impl FromStr for IngestConfig {
    type Err = IngestError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| IngestError::config_with_source("failed to parse TOML config", e))
    }
}

impl IngestConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            IngestError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `DTR_`. For example:
    // - `DTR_DATA_DATASETS_TO_SPLIT` overrides `data.datasets_to_split`
    //   ("all" or a TOML array such as `["train", "val"]`)
    // - `DTR_EXECUTION_LOCALITY_WITH_OUTPUT` overrides `data.execution.locality_with_output`
    // - `DTR_EXECUTION_EXCLUDE_CPU` overrides `data.execution.exclude_resources.cpu`
    // - `DTR_SCALING_NUM_WORKERS` overrides `scaling.num_workers`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("DTR_DATA_DATASETS_TO_SPLIT") {
            match parse_datasets_to_split(&val) {
                Ok(spec) => self.data.datasets_to_split = spec,
                Err(e) => tracing::warn!("Ignoring DTR_DATA_DATASETS_TO_SPLIT: {}", e),
            }
        }

        // Execution overrides start from the ingest defaults if no section was given
        let execution_vars = [
            "DTR_EXECUTION_LOCALITY_WITH_OUTPUT",
            "DTR_EXECUTION_PRESERVE_ORDER",
            "DTR_EXECUTION_VERBOSE_PROGRESS",
            "DTR_EXECUTION_CPU_LIMIT",
            "DTR_EXECUTION_EXCLUDE_CPU",
            "DTR_EXECUTION_EXCLUDE_GPU",
        ];
        if execution_vars.iter().any(|var| std::env::var(var).is_ok()) {
            let mut execution = self
                .data
                .execution
                .take()
                .unwrap_or_else(DataConfig::default_ingest_options);

            if let Ok(val) = std::env::var("DTR_EXECUTION_LOCALITY_WITH_OUTPUT") {
                if let Ok(v) = val.parse() {
                    execution.locality_with_output = v;
                }
            }
            if let Ok(val) = std::env::var("DTR_EXECUTION_PRESERVE_ORDER") {
                if let Ok(v) = val.parse() {
                    execution.preserve_order = v;
                }
            }
            if let Ok(val) = std::env::var("DTR_EXECUTION_VERBOSE_PROGRESS") {
                if let Ok(v) = val.parse() {
                    execution.verbose_progress = v;
                }
            }
            if let Ok(val) = std::env::var("DTR_EXECUTION_CPU_LIMIT") {
                if let Ok(v) = val.parse() {
                    execution.resource_limits.cpu = Some(v);
                }
            }
            if let Ok(val) = std::env::var("DTR_EXECUTION_EXCLUDE_CPU") {
                if let Ok(v) = val.parse() {
                    execution.exclude_resources.cpu = Some(v);
                }
            }
            if let Ok(val) = std::env::var("DTR_EXECUTION_EXCLUDE_GPU") {
                if let Ok(v) = val.parse() {
                    execution.exclude_resources.gpu = Some(v);
                }
            }

            self.data.execution = Some(execution);
        }

        // Scaling overrides
        if let Ok(val) = std::env::var("DTR_SCALING_NUM_WORKERS") {
            if let Ok(v) = val.parse() {
                self.scaling.num_workers = v;
            }
        }
        if let Ok(val) = std::env::var("DTR_SCALING_USE_GPU") {
            if let Ok(v) = val.parse() {
                self.scaling.use_gpu = v;
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        self.scaling.validate()?;

        if let Some(execution) = &self.data.execution {
            if !execution.resource_limits.is_valid() {
                return Err(IngestError::config(
                    "data.execution.resource_limits must be non-negative",
                ));
            }
            if !execution.exclude_resources.is_valid() {
                return Err(IngestError::config(
                    "data.execution.exclude_resources must be non-negative",
                ));
            }
        }

        Ok(())
    }

    /// Builds the sharding coordinator described by the `[data]` section.
    pub fn data_config(&self) -> DataConfig {
        DataConfig::new(
            self.data.datasets_to_split.clone(),
            self.data.execution.clone(),
        )
    }

    /// Resources withheld from the ingest engine for this training run.
    pub fn resource_exclusion(&self) -> ExecutionResources {
        let baseline = self
            .data
            .execution
            .as_ref()
            .map(|e| e.exclude_resources)
            .unwrap_or_else(ExecutionResources::zero);
        ResourceReconciler::default().compute_exclusion(&self.scaling, &baseline)
    }
}

fn parse_datasets_to_split(raw: &str) -> Result<DatasetsToSplit> {
    let raw = raw.trim();
    if raw == "all" {
        return Ok(DatasetsToSplit::All);
    }
    let table: toml::Table = format!("value = {}", raw)
        .parse()
        .map_err(|e| IngestError::config_with_source("invalid datasets_to_split value", e))?;
    match table.get("value") {
        Some(value) => DatasetsToSplit::from_value(value),
        None => Err(IngestError::config("invalid datasets_to_split value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();

        assert_eq!(config.data.datasets_to_split, DatasetsToSplit::All);
        assert!(config.data.execution.is_none());

        assert_eq!(config.scaling.num_workers, 1);
        assert!(!config.scaling.use_gpu);
        assert_eq!(config.scaling.cpu_per_worker(), 1.0);
        assert_eq!(config.scaling.gpu_per_worker(), 0.0);
    }

    #[test]
    fn test_default_validates() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_empty() {
        let config: IngestConfig = "".parse().unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_str_full() {
        let toml = r#"
            [data]
            datasets_to_split = ["train"]

            [data.execution]
            locality_with_output = false
            preserve_order = true
            verbose_progress = true

            [data.execution.resource_limits]
            cpu = 8.0

            [data.execution.exclude_resources]
            cpu = 2.0
            gpu = 1.0

            [scaling]
            num_workers = 2
            use_gpu = true

            [scaling.resources_per_worker]
            CPU = 2.0
            GPU = 1.0
        "#;

        let config: IngestConfig = toml.parse().unwrap();
        assert!(config.validate().is_ok());

        assert_eq!(config.data.datasets_to_split, DatasetsToSplit::names(["train"]));
        let execution = config.data.execution.as_ref().unwrap();
        assert!(!execution.locality_with_output);
        assert!(execution.preserve_order);
        assert!(execution.verbose_progress);
        assert_eq!(execution.resource_limits.cpu, Some(8.0));
        assert_eq!(execution.resource_limits.gpu, None);
        assert_eq!(execution.exclude_resources.cpu, Some(2.0));

        assert_eq!(config.scaling.num_workers, 2);
        assert_eq!(config.scaling.cpu_per_worker(), 2.0);
        assert_eq!(config.scaling.gpu_per_worker(), 1.0);

        // 2 * 2 + 1 trainer + 2 baseline, 2 * 1 + 0 trainer + 1 baseline
        let exclusion = config.resource_exclusion();
        assert_eq!(exclusion.cpu, Some(7.0));
        assert_eq!(exclusion.gpu, Some(3.0));
    }

    #[test]
    fn test_from_str_all_literal() {
        let config: IngestConfig = r#"
            [data]
            datasets_to_split = "all"
        "#
        .parse()
        .unwrap();
        assert_eq!(config.data.datasets_to_split, DatasetsToSplit::All);
    }

    #[test]
    fn test_from_str_rejects_bad_split_shape() {
        for bad in [
            r#"datasets_to_split = "train""#,
            r#"datasets_to_split = {}"#,
            r#"datasets_to_split = 3"#,
        ] {
            let toml = format!("[data]\n{}", bad);
            let result: Result<IngestConfig> = toml.parse();
            assert!(result.is_err(), "accepted {}", bad);
        }
    }

    #[test]
    fn test_from_str_invalid_toml() {
        let result: Result<IngestConfig> = "invalid = [".parse();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [scaling]
            num_workers = 4
            "#
        )
        .unwrap();

        let config = IngestConfig::from_file(file.path()).unwrap();
        assert_eq!(config.scaling.num_workers, 4);
    }

    #[test]
    fn test_from_file_not_found() {
        let result = IngestConfig::from_file("/nonexistent/ingest.toml");
        assert!(matches!(result, Err(IngestError::Storage { .. })));
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[scaling]\nnum_workers = 0").unwrap();
        assert!(IngestConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validate_negative_resources() {
        let mut config = IngestConfig::default();
        let mut per_worker = BTreeMap::new();
        per_worker.insert(CPU.to_string(), -1.0);
        config.scaling.resources_per_worker = Some(per_worker);
        assert!(config.validate().is_err());

        let mut config = IngestConfig::default();
        let mut execution = ExecutionOptions::default();
        execution.exclude_resources.cpu = Some(-2.0);
        config.data.execution = Some(execution);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_datasets_to_split() {
        assert_eq!(parse_datasets_to_split("all").unwrap(), DatasetsToSplit::All);
        assert_eq!(
            parse_datasets_to_split(r#"["train", "val"]"#).unwrap(),
            DatasetsToSplit::names(["train", "val"])
        );
        assert_eq!(parse_datasets_to_split("[]").unwrap(), DatasetsToSplit::none());
        assert!(parse_datasets_to_split("train").is_err());
        assert!(parse_datasets_to_split(r#""train""#).is_err());
    }

    #[test]
    fn test_data_config_uses_execution_section() {
        let mut config = IngestConfig::default();
        let mut execution = ExecutionOptions::default();
        execution.preserve_order = true;
        config.data.execution = Some(execution);
        config.data.datasets_to_split = DatasetsToSplit::none();

        let data_config = config.data_config();
        assert!(data_config.execution_options().preserve_order);
        assert!(!data_config.execution_options().locality_with_output);
        assert_eq!(data_config.datasets_to_split(), &DatasetsToSplit::none());
    }

    // Helper to clear all DTR_ environment variables for test isolation
    fn clear_dtr_env_vars() {
        for (key, _) in std::env::vars() {
            if key.starts_with("DTR_") {
                std::env::remove_var(&key);
            }
        }
    }

    // Environment variable tests are combined into a single test to avoid
    // race conditions when tests run in parallel, since env vars are global state.
    #[test]
    fn test_env_overrides() {
        clear_dtr_env_vars();

        std::env::set_var("DTR_DATA_DATASETS_TO_SPLIT", r#"["train"]"#);
        std::env::set_var("DTR_EXECUTION_LOCALITY_WITH_OUTPUT", "false");
        std::env::set_var("DTR_EXECUTION_EXCLUDE_CPU", "3");
        std::env::set_var("DTR_SCALING_NUM_WORKERS", "4");
        std::env::set_var("DTR_SCALING_USE_GPU", "true");

        let config = IngestConfig::default().with_env_overrides();

        assert_eq!(config.data.datasets_to_split, DatasetsToSplit::names(["train"]));
        let execution = config.data.execution.as_ref().unwrap();
        assert!(!execution.locality_with_output);
        assert_eq!(execution.exclude_resources.cpu, Some(3.0));
        assert_eq!(config.scaling.num_workers, 4);
        assert!(config.scaling.use_gpu);

        clear_dtr_env_vars();

        // Invalid values should be ignored (keep defaults)
        std::env::set_var("DTR_SCALING_NUM_WORKERS", "not_a_number");
        std::env::set_var("DTR_DATA_DATASETS_TO_SPLIT", "train");

        let config = IngestConfig::default().with_env_overrides();
        assert_eq!(config.scaling.num_workers, 1);
        assert_eq!(config.data.datasets_to_split, DatasetsToSplit::All);
        assert!(config.data.execution.is_none());

        clear_dtr_env_vars();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut original = IngestConfig::default();
        original.data.datasets_to_split = DatasetsToSplit::names(["train", "val"]);
        original.scaling.num_workers = 3;

        let toml_str = toml::to_string(&original).unwrap();
        let parsed: IngestConfig = toml_str.parse().unwrap();

        assert_eq!(original.data.datasets_to_split, parsed.data.datasets_to_split);
        assert_eq!(original.scaling, parsed.scaling);
    }
}
