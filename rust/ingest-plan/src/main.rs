//! Distributed Training Runtime Ingest Planner
//!
//! This binary loads an ingest configuration and reports how a training run
//! would treat its datasets: which are split across workers, which are
//! replicated, where split shards are placed and how much capacity is kept
//! away from the ingest engine.
//!
//! # Usage
//!
//! ```bash
//! # Plan with default settings
//! dtr-ingest-plan --datasets train,val
//!
//! # Plan from a configuration file, placing workers on two nodes
//! dtr-ingest-plan --config ingest.toml --datasets train,val --node-ids a,b
//!
//! # Also shard synthetic datasets of 1000 rows and report rows per worker
//! dtr-ingest-plan --config ingest.toml --datasets train,val --rows 1000
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use ingest_core::dataset::LOCAL_NODE_ID;
use ingest_core::{
    DataConfig, DatasetCollection, DatasetRef, ExecutionResources, IngestConfig, LocalEngine,
    NodeId, ResourceReconciler, ShardingCoordinator, WorkerHandle,
};

/// Distributed Training Runtime Ingest Planner
#[derive(Parser, Debug)]
#[command(name = "dtr-ingest-plan")]
#[command(about = "Show how datasets are sharded across training workers")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Dataset names, comma separated
    #[arg(short, long, value_delimiter = ',', default_value = "train")]
    datasets: Vec<String>,

    /// Node id of each worker, comma separated (defaults to one local node)
    #[arg(long, value_delimiter = ',')]
    node_ids: Vec<String>,

    /// Rows per synthetic dataset; 0 skips the dry run
    #[arg(long, default_value = "0")]
    rows: usize,

    /// CPUs available to the dry-run engine
    #[arg(long, default_value = "16")]
    cluster_cpus: f64,

    /// GPUs available to the dry-run engine
    #[arg(long, default_value = "0")]
    cluster_gpus: f64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;

    let world_size = config.scaling.num_workers;
    let node_ids: Vec<NodeId> = if args.node_ids.is_empty() {
        vec![LOCAL_NODE_ID.to_string(); world_size]
    } else {
        args.node_ids.clone()
    };
    if node_ids.len() != world_size {
        return Err(format!(
            "{} node ids given for {} workers",
            node_ids.len(),
            world_size
        )
        .into());
    }

    let mut data_config = config.data_config();
    let train_total = ResourceReconciler::default().train_total_resources(&config.scaling);
    data_config.set_train_total_resources(&train_total);

    tracing::info!("Ingest plan for {} workers", world_size);
    tracing::info!("  Datasets to split: {}", data_config.datasets_to_split());
    for name in &args.datasets {
        if data_config.datasets_to_split().splits(name) {
            tracing::info!("  {}: split into {} equal shards", name, world_size);
        } else {
            tracing::info!("  {}: replicated to every worker", name);
        }
    }
    match data_config.locality_hints(&node_ids) {
        Some(hints) => tracing::info!("  Locality hints: {:?}", hints),
        None => tracing::info!("  Locality hints: disabled"),
    }

    let excluded = data_config.effective_execution_options().exclude_resources;
    tracing::info!(
        "  Excluded from ingest: cpu={} gpu={}",
        excluded.cpu.unwrap_or(0.0),
        excluded.gpu.unwrap_or(0.0)
    );

    if args.rows > 0 {
        dry_run(
            &data_config,
            &args.datasets,
            &node_ids,
            args.rows,
            ExecutionResources::new(args.cluster_cpus, args.cluster_gpus),
        )?;
    }

    Ok(())
}

/// Shards synthetic datasets with the configured coordinator and reports the
/// rows each worker receives in one epoch.
fn dry_run(
    data_config: &DataConfig,
    names: &[String],
    node_ids: &[NodeId],
    rows: usize,
    cluster: ExecutionResources,
) -> Result<(), Box<dyn std::error::Error>> {
    let world_size = node_ids.len();
    let engine = LocalEngine::with_nodes(cluster, dedup(node_ids));

    let datasets: DatasetCollection = names
        .iter()
        .map(|name| {
            let dataset: DatasetRef = Arc::new(engine.range(rows, world_size.max(1) * 2));
            (name.clone(), dataset)
        })
        .collect();

    let run_id = Uuid::new_v4();
    let handles: Vec<WorkerHandle> = (0..world_size)
        .map(|rank| WorkerHandle::new(run_id, rank))
        .collect();

    let mut assignment = data_config.configure(&datasets, world_size, &handles, node_ids)?;

    for (rank, shards) in assignment.iter_mut().enumerate() {
        for name in names {
            if let Some(shard) = shards.get(name) {
                let count = shard.iter_rows()?.len();
                tracing::info!(
                    "  worker {} ({}): {} rows of {}",
                    rank,
                    node_ids[rank],
                    count,
                    name
                );
            }
        }
    }

    Ok(())
}

fn dedup(node_ids: &[NodeId]) -> Vec<NodeId> {
    let mut unique: Vec<NodeId> = Vec::new();
    for id in node_ids {
        if !unique.contains(id) {
            unique.push(id.clone());
        }
    }
    unique
}
