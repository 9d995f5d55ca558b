// rust/ingest-core/src/dataset/traits.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{IngestError, Result};
use crate::execution::ExecutionOptions;

/// Identifier of the cluster node a block or worker lives on.
pub type NodeId = String;

/// Shared handle to a lazy dataset.
pub type DatasetRef = Arc<dyn Dataset>;

/// A single column value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

impl Value {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Int(v) => *v as f64,
            Self::Float(v) => *v,
        }
    }
}

/// One record: column name to value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.0.insert(column.into(), value);
        self
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Value) {
        self.0.insert(column.into(), value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

/// A contiguous group of rows stored on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub rows: Vec<Row>,
    pub node_id: Option<NodeId>,
}

impl Block {
    pub fn new(rows: Vec<Row>, node_id: Option<NodeId>) -> Self {
        Self { rows, node_id }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Columnar batch handed to training code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub columns: BTreeMap<String, Vec<Value>>,
    pub num_rows: usize,
}

impl Batch {
    pub fn from_rows(rows: &[Row]) -> Self {
        let mut columns: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for row in rows {
            for (name, value) in row.columns() {
                columns.entry(name.clone()).or_default().push(*value);
            }
        }
        Self {
            columns,
            num_rows: rows.len(),
        }
    }

    /// Total number of values across all columns.
    pub fn size(&self) -> usize {
        self.columns.values().map(Vec::len).sum()
    }
}

/// Per-worker stream over a dataset or one partition of it.
///
/// Every call to `iter_rows` is one epoch: the underlying plan is executed
/// again unless the dataset was materialized.
pub trait DataIterator: Send + fmt::Debug {
    /// Executes one epoch and returns its rows in delivery order.
    fn iter_rows(&mut self) -> Result<Vec<Row>>;

    /// Executes one epoch and groups its rows into batches of `batch_size`.
    fn iter_batches(&mut self, batch_size: usize) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            return Err(IngestError::config("batch_size must be greater than 0"));
        }
        let rows = self.iter_rows()?;
        Ok(rows.chunks(batch_size).map(Batch::from_rows).collect())
    }

    /// Execution options this iterator runs with.
    fn execution_options(&self) -> &ExecutionOptions;

    /// Number of epochs this iterator has completed.
    fn epochs_completed(&self) -> u64;
}

/// Capabilities the sharding coordinator needs from a dataset engine.
pub trait Dataset: Send + Sync + fmt::Debug {
    /// Iterator over every row of the dataset.
    fn iterator(&self) -> Box<dyn DataIterator>;

    /// Splits the dataset into `n` iterators that together yield every row once.
    ///
    /// With `equal` the partitions differ by at most one row. `locality_hints`,
    /// when given, holds one node id per partition.
    fn streaming_split(
        &self,
        n: usize,
        equal: bool,
        locality_hints: Option<&[NodeId]>,
    ) -> Result<Vec<Box<dyn DataIterator>>>;

    /// Executes the dataset once and freezes the result.
    fn materialize(&self) -> Result<DatasetRef>;

    /// Independent handle that can carry its own execution options.
    fn copy(&self) -> Box<dyn Dataset>;

    fn set_execution_options(&mut self, options: ExecutionOptions);

    fn execution_options(&self) -> &ExecutionOptions;
}
