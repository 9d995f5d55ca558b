// rust/ingest-core/src/dataset/local.rs

//! In-process lazy dataset engine.
//!
//! A `LocalDataset` is a source of blocks plus a chain of transformations.
//! Nothing runs until an iterator starts an epoch; each epoch executes the
//! whole chain again, so random transformations produce a fresh result every
//! time. `materialize` executes once and keeps the output.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::Result;
use crate::execution::{DataContext, ExecutionOptions};
use crate::resources::ExecutionResources;

use super::split::SplitCoordinator;
use super::traits::{Block, DataIterator, Dataset, DatasetRef, NodeId, Row, Value};

/// Node id used when the engine is created without explicit nodes.
pub const LOCAL_NODE_ID: &str = "node-0";

type MapFn = Arc<dyn Fn(Row) -> Row + Send + Sync>;

/// A transformation applied at execution time.
#[derive(Clone)]
enum Op {
    RandomizeBlockOrder { seed: Option<u64> },
    RandomShuffle { seed: Option<u64> },
    Map(MapFn),
}

impl fmt::Debug for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RandomizeBlockOrder { seed } => {
                f.debug_struct("RandomizeBlockOrder").field("seed", seed).finish()
            }
            Self::RandomShuffle { seed } => {
                f.debug_struct("RandomShuffle").field("seed", seed).finish()
            }
            Self::Map(_) => f.write_str("Map"),
        }
    }
}

#[derive(Debug)]
struct Plan {
    source: Arc<Vec<Block>>,
    ops: Vec<Op>,
}

#[derive(Debug)]
struct EngineInner {
    cluster: ExecutionResources,
    node_ids: Vec<NodeId>,
}

/// Cluster the local datasets execute on.
#[derive(Debug, Clone)]
pub struct LocalEngine {
    inner: Arc<EngineInner>,
}

impl LocalEngine {
    /// Single-node engine with the given capacity.
    pub fn new(cluster: ExecutionResources) -> Self {
        Self::with_nodes(cluster, vec![LOCAL_NODE_ID.to_string()])
    }

    /// Engine whose blocks are placed round-robin over `node_ids`.
    pub fn with_nodes(cluster: ExecutionResources, node_ids: Vec<NodeId>) -> Self {
        let node_ids = if node_ids.is_empty() {
            vec![LOCAL_NODE_ID.to_string()]
        } else {
            node_ids
        };
        Self {
            inner: Arc::new(EngineInner { cluster, node_ids }),
        }
    }

    pub fn cluster_resources(&self) -> &ExecutionResources {
        &self.inner.cluster
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.inner.node_ids
    }

    /// Rows `{"id": 0}` .. `{"id": n - 1}` in `parallelism` blocks.
    pub fn range(&self, n: usize, parallelism: usize) -> LocalDataset {
        let rows = (0..n).map(|i| Row::new().with("id", Value::Int(i as i64))).collect();
        self.from_rows(rows, parallelism)
    }

    /// Dataset over the given rows, split into `parallelism` blocks.
    pub fn from_rows(&self, rows: Vec<Row>, parallelism: usize) -> LocalDataset {
        let blocks = chunk_rows(rows, parallelism)
            .into_iter()
            .enumerate()
            .map(|(i, rows)| Block::new(rows, Some(self.node_for(i))))
            .collect();
        LocalDataset::from_blocks(self.clone(), blocks)
    }

    fn node_for(&self, block_index: usize) -> NodeId {
        let nodes = &self.inner.node_ids;
        nodes[block_index % nodes.len()].clone()
    }
}

/// Lazy dataset executed by a `LocalEngine`.
#[derive(Clone)]
pub struct LocalDataset {
    engine: LocalEngine,
    plan: Arc<Plan>,
    options: ExecutionOptions,
    materialized: bool,
}

impl fmt::Debug for LocalDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalDataset")
            .field("num_blocks", &self.plan.source.len())
            .field("ops", &self.plan.ops)
            .field("materialized", &self.materialized)
            .finish()
    }
}

impl LocalDataset {
    fn from_blocks(engine: LocalEngine, blocks: Vec<Block>) -> Self {
        Self {
            engine,
            plan: Arc::new(Plan {
                source: Arc::new(blocks),
                ops: Vec::new(),
            }),
            options: DataContext::get_current().execution_options,
            materialized: false,
        }
    }

    fn with_op(&self, op: Op) -> Self {
        let mut ops = self.plan.ops.clone();
        ops.push(op);
        Self {
            engine: self.engine.clone(),
            plan: Arc::new(Plan {
                source: self.plan.source.clone(),
                ops,
            }),
            options: self.options.clone(),
            materialized: false,
        }
    }

    /// Shuffles block order on every execution.
    #[must_use]
    pub fn randomize_block_order(&self) -> Self {
        self.with_op(Op::RandomizeBlockOrder { seed: None })
    }

    /// Shuffles block order with a fixed seed; every epoch yields the same order.
    #[must_use]
    pub fn randomize_block_order_seeded(&self, seed: u64) -> Self {
        self.with_op(Op::RandomizeBlockOrder { seed: Some(seed) })
    }

    /// Globally shuffles rows, keeping the number of blocks.
    #[must_use]
    pub fn random_shuffle(&self, seed: Option<u64>) -> Self {
        self.with_op(Op::RandomShuffle { seed })
    }

    /// Applies `f` to every row.
    #[must_use]
    pub fn map<F>(&self, f: F) -> Self
    where
        F: Fn(Row) -> Row + Send + Sync + 'static,
    {
        self.with_op(Op::Map(Arc::new(f)))
    }

    /// Executes the plan once and returns a frozen dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if the execution cannot start on this engine.
    pub fn materialize_local(&self) -> Result<LocalDataset> {
        let blocks = self.execute()?;
        let mut frozen = Self::from_blocks(self.engine.clone(), blocks);
        frozen.options = self.options.clone();
        frozen.materialized = true;
        Ok(frozen)
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Number of rows, computed by executing the plan.
    pub fn count(&self) -> Result<usize> {
        if self.plan.ops.is_empty() {
            return Ok(self.plan.source.iter().map(Block::len).sum());
        }
        Ok(self.execute()?.iter().map(Block::len).sum())
    }

    pub fn num_blocks(&self) -> usize {
        self.plan.source.len()
    }

    /// Runs the plan and returns its output blocks.
    pub(crate) fn execute(&self) -> Result<Vec<Block>> {
        let usable = self.options.usable_resources(self.engine.cluster_resources())?;

        let mut blocks: Vec<Block> = self.plan.source.as_ref().clone();
        for op in &self.plan.ops {
            blocks = apply_op(op, blocks);
        }

        let rows: usize = blocks.iter().map(Block::len).sum();
        if self.options.verbose_progress {
            tracing::info!(
                "Executed {} blocks ({} rows) with cpu={:?} gpu={:?}",
                blocks.len(),
                rows,
                usable.cpu,
                usable.gpu
            );
        } else {
            tracing::debug!("Executed {} blocks ({} rows)", blocks.len(), rows);
        }

        Ok(blocks)
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

fn apply_op(op: &Op, mut blocks: Vec<Block>) -> Vec<Block> {
    match op {
        Op::RandomizeBlockOrder { seed } => {
            blocks.shuffle(&mut seeded_rng(*seed));
            blocks
        }
        Op::RandomShuffle { seed } => {
            let nodes: Vec<Option<NodeId>> = blocks.iter().map(|b| b.node_id.clone()).collect();
            let mut rows: Vec<Row> = blocks.into_iter().flat_map(|b| b.rows).collect();
            rows.shuffle(&mut seeded_rng(*seed));
            chunk_rows(rows, nodes.len())
                .into_iter()
                .zip(nodes)
                .map(|(rows, node_id)| Block::new(rows, node_id))
                .collect()
        }
        Op::Map(f) => blocks
            .into_iter()
            .map(|block| {
                Block::new(block.rows.into_iter().map(f.as_ref()).collect(), block.node_id)
            })
            .collect(),
    }
}

/// Splits rows into `parts` groups whose sizes differ by at most one.
///
/// Earlier groups receive the remainder.
pub(crate) fn chunk_rows(rows: Vec<Row>, parts: usize) -> Vec<Vec<Row>> {
    let parts = parts.clamp(1, rows.len().max(1));
    let per_part = rows.len() / parts;
    let remainder = rows.len() % parts;

    let mut iter = rows.into_iter();
    (0..parts)
        .map(|i| {
            let extra = if i < remainder { 1 } else { 0 };
            iter.by_ref().take(per_part + extra).collect()
        })
        .collect()
}

impl Dataset for LocalDataset {
    fn iterator(&self) -> Box<dyn DataIterator> {
        Box::new(LocalIterator {
            dataset: self.clone(),
            epoch: 0,
        })
    }

    fn streaming_split(
        &self,
        n: usize,
        equal: bool,
        locality_hints: Option<&[NodeId]>,
    ) -> Result<Vec<Box<dyn DataIterator>>> {
        SplitCoordinator::start(self.clone(), n, equal, locality_hints)
    }

    fn materialize(&self) -> Result<DatasetRef> {
        Ok(Arc::new(self.materialize_local()?))
    }

    fn copy(&self) -> Box<dyn Dataset> {
        Box::new(self.clone())
    }

    fn set_execution_options(&mut self, options: ExecutionOptions) {
        self.options = options;
    }

    fn execution_options(&self) -> &ExecutionOptions {
        &self.options
    }
}

/// Iterator over the whole dataset; every epoch re-executes the plan.
#[derive(Debug)]
pub struct LocalIterator {
    dataset: LocalDataset,
    epoch: u64,
}

impl DataIterator for LocalIterator {
    fn iter_rows(&mut self) -> Result<Vec<Row>> {
        let blocks = self.dataset.execute()?;
        self.epoch += 1;
        Ok(blocks.into_iter().flat_map(|b| b.rows).collect())
    }

    fn execution_options(&self) -> &ExecutionOptions {
        &self.dataset.options
    }

    fn epochs_completed(&self) -> u64 {
        self.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;

    fn engine() -> LocalEngine {
        LocalEngine::new(ExecutionResources::new(4.0, 0.0))
    }

    fn ids(rows: &[Row]) -> Vec<f64> {
        rows.iter()
            .map(|r| r.get("id").map(Value::as_f64).unwrap_or(f64::NAN))
            .collect()
    }

    fn two_epochs(ds: &LocalDataset) -> (Vec<f64>, Vec<f64>) {
        let mut iter = ds.iterator();
        let first = ids(&iter.iter_rows().unwrap());
        let second = ids(&iter.iter_rows().unwrap());
        (first, second)
    }

    fn random_scale(row: Row) -> Row {
        let id = row.get("id").map(Value::as_f64).unwrap_or(0.0);
        row.with("id", Value::Float(id * rand::random::<f64>()))
    }

    #[test]
    fn test_chunk_rows_sizes() {
        let rows: Vec<Row> = (0..10).map(|_| Row::new()).collect();
        let sizes: Vec<usize> = chunk_rows(rows, 3).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![4, 3, 3]);

        let sizes: Vec<usize> = chunk_rows(vec![Row::new(); 2], 5).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1]);

        assert_eq!(chunk_rows(Vec::new(), 4).len(), 1);
    }

    #[test]
    fn test_range() {
        let ds = engine().range(10, 3);
        assert_eq!(ds.num_blocks(), 3);
        assert_eq!(ds.count().unwrap(), 10);

        let rows = ds.iterator().iter_rows().unwrap();
        assert_eq!(ids(&rows), (0..10).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocks_placed_round_robin() {
        let engine = LocalEngine::with_nodes(
            ExecutionResources::new(4.0, 0.0),
            vec!["a".to_string(), "b".to_string()],
        );
        let ds = engine.range(4, 4);
        let nodes: Vec<_> = ds.plan.source.iter().map(|b| b.node_id.clone()).collect();
        assert_eq!(
            nodes,
            vec![
                Some("a".to_string()),
                Some("b".to_string()),
                Some("a".to_string()),
                Some("b".to_string())
            ]
        );
    }

    #[test]
    fn test_unmaterialized_random_ops_differ_per_epoch() {
        let base = engine().range(100, 100);

        let (a, b) = two_epochs(&base.randomize_block_order());
        assert_ne!(a, b);

        let (a, b) = two_epochs(&base.random_shuffle(None));
        assert_ne!(a, b);

        let (a, b) = two_epochs(&base.map(random_scale));
        assert_ne!(a, b);
    }

    #[test]
    fn test_materialized_random_ops_are_frozen() {
        let base = engine().range(100, 100);

        for ds in [
            base.randomize_block_order(),
            base.random_shuffle(None),
            base.map(random_scale),
        ] {
            let frozen = ds.materialize_local().unwrap();
            assert!(frozen.is_materialized());
            let (a, b) = two_epochs(&frozen);
            assert_eq!(a, b);
            assert_eq!(a.len(), 100);
        }
    }

    #[test]
    fn test_seeded_shuffle_is_repeatable() {
        let ds = engine().range(50, 5).random_shuffle(Some(7));
        let (a, b) = two_epochs(&ds);
        assert_eq!(a, b);
        assert_ne!(a, (0..50).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_shuffle_keeps_all_rows() {
        let ds = engine().range(37, 4).random_shuffle(None);
        let mut rows = ids(&ds.iterator().iter_rows().unwrap());
        rows.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(rows, (0..37).map(|i| i as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_execution_fails_without_cpu() {
        let mut ds = engine().range(10, 2);
        let mut options = ExecutionOptions::default();
        options.resource_limits.cpu = Some(0.0);
        ds.set_execution_options(options);

        // Building the iterator is fine; the failure comes when an epoch starts
        let mut iter = ds.iterator();
        let err = iter.iter_rows().unwrap_err();
        assert!(matches!(err, IngestError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_output_order_ignores_preserve_order() {
        let run = |ds: LocalDataset, preserve_order: bool| {
            let mut ds = ds;
            let mut options = ExecutionOptions::default();
            options.preserve_order = preserve_order;
            ds.set_execution_options(options);
            two_epochs(&ds)
        };

        let ordered = engine().range(20, 5);
        let expected: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(run(ordered.clone(), true), (expected.clone(), expected.clone()));
        assert_eq!(run(ordered, false), (expected.clone(), expected.clone()));

        // Random ops stay random with the flag set
        let seeded = engine().range(20, 5).random_shuffle(Some(3));
        let (a, _) = run(seeded.clone(), true);
        assert_eq!(run(seeded, false).0, a);
        assert_ne!(a, expected);

        let (a, b) = run(engine().range(100, 100).random_shuffle(None), true);
        assert_ne!(a, b);
    }

    #[test]
    fn test_copy_has_independent_options() {
        let mut ds = engine().range(10, 2);
        ds.set_execution_options(ExecutionOptions::default());

        let mut copy = ds.copy();
        let mut options = ExecutionOptions::default();
        options.verbose_progress = true;
        copy.set_execution_options(options);

        assert!(copy.execution_options().verbose_progress);
        assert!(!Dataset::execution_options(&ds).verbose_progress);
    }

    #[test]
    fn test_iter_batches() {
        let ds = engine().range(10, 2);
        let batches = ds.iterator().iter_batches(4).unwrap();
        let sizes: Vec<usize> = batches.iter().map(|b| b.num_rows).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(ds.iterator().iter_batches(0).is_err());
    }

    #[test]
    fn test_epochs_completed() {
        let ds = engine().range(4, 2);
        let mut iter = ds.iterator();
        assert_eq!(iter.epochs_completed(), 0);
        iter.iter_rows().unwrap();
        iter.iter_batches(2).unwrap();
        assert_eq!(iter.epochs_completed(), 2);
    }
}
