use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::core::{lock, Result};
use crate::staging::{storable, RowKey, Sample, StagingRow, StagingStore};

#[derive(Debug, Default)]
struct Inner {
    next_key: RowKey,
    rows: BTreeMap<RowKey, StagingRow>,
}

/// Process-local staging, for tests and single-process demos.
#[derive(Debug, Default)]
pub struct MemoryStaging {
    inner: Mutex<Inner>,
}

impl MemoryStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StagingStore for MemoryStaging {
    fn insert(&self, samples: &[Sample]) -> Result<usize> {
        let mut inner = lock(&self.inner);
        let mut stored = 0;
        for sample in storable(samples) {
            stored += 1;
            inner.next_key += 1;
            let key = inner.next_key;
            inner.rows.insert(
                key,
                StagingRow {
                    key,
                    tag: sample.tag.clone(),
                    value: sample.value.clone(),
                    timestamp_ns: sample.timestamp_ns,
                },
            );
        }
        Ok(stored)
    }

    fn select(&self, tag: &str, t0_ns: i64, t1_ns: i64) -> Result<Vec<StagingRow>> {
        let inner = lock(&self.inner);
        let mut rows: Vec<StagingRow> = inner
            .rows
            .values()
            .filter(|row| row.tag == tag && row.timestamp_ns >= t0_ns && row.timestamp_ns <= t1_ns)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.timestamp_ns, row.key));
        Ok(rows)
    }

    fn delete(&self, keys: &[RowKey]) -> Result<usize> {
        let mut inner = lock(&self.inner);
        Ok(keys
            .iter()
            .filter(|key| inner.rows.remove(*key).is_some())
            .count())
    }

    fn tags(&self) -> Result<Vec<String>> {
        let inner = lock(&self.inner);
        let tags: BTreeSet<&str> = inner.rows.values().map(|row| row.tag.as_str()).collect();
        Ok(tags.into_iter().map(str::to_string).collect())
    }
}
