// rust/ingest-core/src/dataset/mod.rs

//! Dataset handles consumed by the sharding coordinator.
//!
//! The coordinator only relies on the `Dataset` and `DataIterator` traits.
//! `LocalEngine` and `LocalDataset` are an in-process engine implementing
//! them: lazy plans, per-epoch re-execution, materialization, and a
//! streaming split that keeps partitions disjoint within each epoch.
//!
//! # Example
//!
//! ```ignore
//! use ingest_core::dataset::{Dataset, LocalEngine};
//! use ingest_core::ExecutionResources;
//!
//! let engine = LocalEngine::new(ExecutionResources::new(4.0, 0.0));
//! let ds = engine.range(100, 10).random_shuffle(None);
//!
//! let mut splits = ds.streaming_split(2, true, None)?;
//! for split in splits.iter_mut() {
//!     let rows = split.iter_rows()?;
//!     // 50 rows per split, a new shuffle every epoch
//! }
//! ```

mod local;
mod split;
mod traits;

pub use local::{LocalDataset, LocalEngine, LocalIterator, LOCAL_NODE_ID};
pub use split::SplitIterator;
pub use traits::{Batch, Block, DataIterator, Dataset, DatasetRef, NodeId, Row, Value};
