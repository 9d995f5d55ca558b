// rust/ingest-core/src/split.rs

//! Per-dataset split policy.
//!
//! A split dataset is partitioned across workers so that every row lands on
//! exactly one worker. Every other dataset is replicated whole to each worker.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, Result};

/// Which datasets are split across workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "toml::Value", into = "toml::Value")]
pub enum DatasetsToSplit {
    /// Split every dataset passed to the coordinator.
    #[default]
    All,
    /// Split only the named datasets. An empty list replicates everything.
    Names(Vec<String>),
}

impl DatasetsToSplit {
    /// Split exactly the given dataset names.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Names(names.into_iter().map(Into::into).collect())
    }

    /// Split nothing; every worker receives every dataset in full.
    pub fn none() -> Self {
        Self::Names(Vec::new())
    }

    /// Validates a raw, loosely typed split specification.
    ///
    /// Only the literal string `"all"` or an array of strings are accepted.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for any other shape, including a bare
    /// dataset name and a table.
    pub fn from_value(value: &toml::Value) -> Result<Self> {
        match value {
            toml::Value::String(s) if s == "all" => Ok(Self::All),
            toml::Value::Array(items) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        toml::Value::String(name) => names.push(name.clone()),
                        _ => return Err(shape_error(value)),
                    }
                }
                Ok(Self::Names(names))
            }
            _ => Err(shape_error(value)),
        }
    }

    /// Resolves the policy against the datasets present in one run.
    ///
    /// Named datasets that are not present are ignored.
    pub fn resolve<'a, I>(&self, available: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        match self {
            Self::All => available.into_iter().cloned().collect(),
            Self::Names(names) => available
                .into_iter()
                .filter(|name| names.contains(name))
                .cloned()
                .collect(),
        }
    }

    /// Returns true if `name` would be split when present.
    pub fn splits(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.iter().any(|n| n == name),
        }
    }
}

fn shape_error(value: &toml::Value) -> IngestError {
    IngestError::config(format!(
        "`datasets_to_split` should be a 'all' or a list of strings of dataset names. \
         Received {} with value {}.",
        value.type_str(),
        value
    ))
}

impl TryFrom<toml::Value> for DatasetsToSplit {
    type Error = IngestError;

    fn try_from(value: toml::Value) -> Result<Self> {
        Self::from_value(&value)
    }
}

impl From<DatasetsToSplit> for toml::Value {
    fn from(spec: DatasetsToSplit) -> Self {
        match spec {
            DatasetsToSplit::All => toml::Value::String("all".to_string()),
            DatasetsToSplit::Names(names) => {
                toml::Value::Array(names.into_iter().map(toml::Value::String).collect())
            }
        }
    }
}

impl fmt::Display for DatasetsToSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Names(names) => write!(f, "[{}]", names.join(", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_default_is_all() {
        assert_eq!(DatasetsToSplit::default(), DatasetsToSplit::All);
    }

    #[test]
    fn test_resolve_all() {
        let available = keys(&["train", "test", "val"]);
        let split = DatasetsToSplit::All.resolve(&available);
        assert_eq!(split.len(), 3);
        assert!(split.contains("train"));
        assert!(split.contains("val"));
    }

    #[test]
    fn test_resolve_explicit_ignores_missing() {
        let available = keys(&["train", "test"]);
        let split = DatasetsToSplit::names(["train", "holdout"]).resolve(&available);
        assert_eq!(split.into_iter().collect::<Vec<_>>(), vec!["train".to_string()]);
    }

    #[test]
    fn test_resolve_empty_splits_nothing() {
        let available = keys(&["train", "test"]);
        assert!(DatasetsToSplit::none().resolve(&available).is_empty());
    }

    #[test]
    fn test_from_value_accepts_all_and_lists() {
        let all = DatasetsToSplit::from_value(&toml::Value::String("all".into())).unwrap();
        assert_eq!(all, DatasetsToSplit::All);

        let list = toml::Value::Array(vec![
            toml::Value::String("train".into()),
            toml::Value::String("test".into()),
        ]);
        assert_eq!(
            DatasetsToSplit::from_value(&list).unwrap(),
            DatasetsToSplit::names(["train", "test"])
        );

        let empty = toml::Value::Array(vec![]);
        assert_eq!(DatasetsToSplit::from_value(&empty).unwrap(), DatasetsToSplit::none());
    }

    #[test]
    fn test_from_value_rejects_other_shapes() {
        let invalid = vec![
            toml::Value::String("train".into()),
            toml::Value::Table(toml::map::Map::new()),
            toml::Value::Integer(1),
            toml::Value::Array(vec![toml::Value::Integer(1)]),
        ];

        for value in invalid {
            let err = DatasetsToSplit::from_value(&value).unwrap_err();
            assert!(matches!(err, IngestError::Config { .. }));
            assert!(
                err.to_string().contains("`datasets_to_split` should be"),
                "unexpected message: {}",
                err
            );
        }
    }

    #[test]
    fn test_deserialize_through_validation() {
        #[derive(Deserialize)]
        struct Wrapper {
            datasets_to_split: DatasetsToSplit,
        }

        let ok: Wrapper = toml::from_str(r#"datasets_to_split = ["train"]"#).unwrap();
        assert_eq!(ok.datasets_to_split, DatasetsToSplit::names(["train"]));

        let bad: std::result::Result<Wrapper, _> = toml::from_str(r#"datasets_to_split = "train""#);
        let message = bad.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(message.contains("`datasets_to_split` should be"));
    }

    #[test]
    fn test_splits() {
        assert!(DatasetsToSplit::All.splits("anything"));
        let policy = DatasetsToSplit::names(["train"]);
        assert!(policy.splits("train"));
        assert!(!policy.splits("test"));
    }

    #[test]
    fn test_display() {
        assert_eq!(DatasetsToSplit::All.to_string(), "all");
        assert_eq!(DatasetsToSplit::names(["a", "b"]).to_string(), "[a, b]");
    }
}
