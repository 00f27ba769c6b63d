//! Data-provider collaborators: where rows come from, and whether they may be released.

use crate::models::{GroupKey, Query};
use crate::operations::Columns;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("column {0} is not available")]
    UnknownColumn(String),

    #[error("loader unavailable: {0}")]
    Unavailable(String),
}

/// Loads the selected columns, column-major.
pub trait DataLoader: Send + Sync {
    fn provide(&self, query: &Query) -> Result<Columns, LoaderError>;

    /// Rows falling into one output group. Without group attributes every group sees all rows.
    fn provide_group(&self, query: &Query, _group: &GroupKey) -> Result<Columns, LoaderError> {
        self.provide(query)
    }
}

/// Decides whether loaded rows may contribute. `false` means "answer neutrally".
pub trait Neutralizer: Send + Sync {
    fn vet(&self, query: &Query, columns: &Columns) -> bool;
}

/// Uniform integers in `[min, max]` for every selected column.
pub struct RandomLoader {
    min: i64,
    max: i64,
    rows: usize,
    rng: Mutex<ChaCha20Rng>,
}

impl RandomLoader {
    pub fn new(min: i64, max: i64, rows: usize, seed: u64) -> Result<Self, LoaderError> {
        if min > max {
            return Err(LoaderError::Unavailable(format!("minimum {min} > maximum {max}")));
        }
        Ok(Self {
            min,
            max,
            rows,
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        })
    }
}

impl DataLoader for RandomLoader {
    fn provide(&self, query: &Query) -> Result<Columns, LoaderError> {
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| LoaderError::Unavailable("rng poisoned".into()))?;
        Ok(query
            .selector
            .iter()
            .map(|_| (0..self.rows).map(|_| rng.gen_range(self.min..=self.max)).collect())
            .collect())
    }
}

/// Fixed named columns.
pub struct StaticLoader {
    columns: Vec<(String, Vec<i64>)>,
}

impl StaticLoader {
    pub fn new(columns: impl IntoIterator<Item = (String, Vec<i64>)>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
        }
    }

    /// A single column `"0"`.
    pub fn single(values: Vec<i64>) -> Self {
        Self::new([("0".to_string(), values)])
    }
}

impl DataLoader for StaticLoader {
    fn provide(&self, query: &Query) -> Result<Columns, LoaderError> {
        query
            .selector
            .iter()
            .map(|id| {
                self.columns
                    .iter()
                    .find(|(name, _)| name == id)
                    .map(|(_, values)| values.clone())
                    .ok_or_else(|| LoaderError::UnknownColumn(id.clone()))
            })
            .collect()
    }
}

/// One loader per output group; groups it does not know contribute no rows.
pub struct GroupedLoader {
    groups: BTreeMap<GroupKey, Box<dyn DataLoader>>,
}

impl GroupedLoader {
    pub fn new(groups: impl IntoIterator<Item = (GroupKey, Box<dyn DataLoader>)>) -> Self {
        Self {
            groups: groups.into_iter().collect(),
        }
    }
}

impl DataLoader for GroupedLoader {
    /// All groups' rows, concatenated per column.
    fn provide(&self, query: &Query) -> Result<Columns, LoaderError> {
        let mut out: Columns = vec![Vec::new(); query.selector.len()];
        for loader in self.groups.values() {
            for (col, values) in out.iter_mut().zip(loader.provide(query)?) {
                col.extend(values);
            }
        }
        Ok(out)
    }

    fn provide_group(&self, query: &Query, group: &GroupKey) -> Result<Columns, LoaderError> {
        match self.groups.get(group) {
            Some(loader) => loader.provide(query),
            None => Ok(vec![Vec::new(); query.selector.len()]),
        }
    }
}

/// Always fails; stands in for a provider whose storage is down.
pub struct FailingLoader;

impl DataLoader for FailingLoader {
    fn provide(&self, _query: &Query) -> Result<Columns, LoaderError> {
        Err(LoaderError::Unavailable("no data source".into()))
    }
}

pub struct AcceptAll;

impl Neutralizer for AcceptAll {
    fn vet(&self, _query: &Query, _columns: &Columns) -> bool {
        true
    }
}

/// Refuses to answer from fewer than `minimum` rows.
pub struct MinimumResultsSize {
    pub minimum: usize,
}

impl Neutralizer for MinimumResultsSize {
    fn vet(&self, _query: &Query, columns: &Columns) -> bool {
        columns.first().map(Vec::len).unwrap_or(0) >= self.minimum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationSpec;

    fn query(cols: &[&str]) -> Query {
        Query::new(OperationSpec::named("sum"), cols.iter().map(|c| c.to_string()).collect())
    }

    #[test]
    fn random_loader_is_column_major_and_bounded() {
        let loader = RandomLoader::new(2, 4, 10, 1).unwrap();
        let cols = loader.provide(&query(&["a", "b"])).unwrap();
        assert_eq!(cols.len(), 2);
        assert!(cols.iter().all(|c| c.len() == 10 && c.iter().all(|v| (2..=4).contains(v))));
        assert!(RandomLoader::new(5, 1, 1, 0).is_err());
    }

    #[test]
    fn static_loader_selects_by_name() {
        let loader = StaticLoader::new([("x".to_string(), vec![1]), ("y".to_string(), vec![2])]);
        assert_eq!(loader.provide(&query(&["y", "x"])).unwrap(), vec![vec![2], vec![1]]);
        assert!(loader.provide(&query(&["z"])).is_err());
    }

    #[test]
    fn grouped_loader_splits_rows_by_group() {
        let loader = GroupedLoader::new([
            ("[0]".to_string(), Box::new(StaticLoader::single(vec![1, 2])) as Box<dyn DataLoader>),
            ("[1]".to_string(), Box::new(StaticLoader::single(vec![7])) as Box<dyn DataLoader>),
        ]);
        let q = query(&["0"]);
        assert_eq!(loader.provide_group(&q, &"[1]".to_string()).unwrap(), vec![vec![7]]);
        assert_eq!(loader.provide_group(&q, &"[9]".to_string()).unwrap(), vec![Vec::<i64>::new()]);
        assert_eq!(loader.provide(&q).unwrap(), vec![vec![1, 2, 7]]);
    }

    #[test]
    fn minimum_results_size_counts_rows() {
        let n = MinimumResultsSize { minimum: 3 };
        let q = query(&["a"]);
        assert!(n.vet(&q, &vec![vec![1, 2, 3]]));
        assert!(!n.vet(&q, &vec![vec![1, 2]]));
    }
}
