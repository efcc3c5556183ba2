//! Staging store: samples waiting to be archived.
//!
//! Jobs append, the archiver selects per tag and then deletes exactly the
//! keys it selected, so a sample inserted between select and delete survives
//! until the next cycle.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

use crate::core::{Result, Value};
use crate::protocol::Readings;

pub use memory::MemoryStaging;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStaging;

pub type RowKey = u64;

/// A sample on its way into staging.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub tag: String,
    pub value: Value,
    pub timestamp_ns: i64,
}

impl Sample {
    pub fn new(tag: impl Into<String>, value: Value, timestamp_ns: i64) -> Self {
        Self {
            tag: tag.into(),
            value,
            timestamp_ns,
        }
    }

    pub fn from_readings(readings: Readings) -> Vec<Sample> {
        readings
            .into_iter()
            .map(|(tag, reading)| Sample {
                tag,
                value: reading.value,
                timestamp_ns: reading.timestamp_ns,
            })
            .collect()
    }
}

/// Samples that can be persisted. Non-finite floats are dropped with a
/// warning: JSON has no spelling for them and no tag datatype accepts them.
pub(crate) fn storable(samples: &[Sample]) -> impl Iterator<Item = &Sample> {
    samples.iter().filter(|sample| {
        let finite = sample.value.is_finite();
        if !finite {
            log::warn!(
                "{}: dropping non-finite value {} at {}",
                sample.tag,
                sample.value,
                sample.timestamp_ns
            );
        }
        finite
    })
}

/// A persisted sample and the key that identifies it for deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub key: RowKey,
    pub tag: String,
    pub value: Value,
    pub timestamp_ns: i64,
}

pub trait StagingStore: Send + Sync {
    /// Append samples and return how many were stored. Duplicate (tag,
    /// timestamp) pairs are accepted; non-finite floats are dropped.
    fn insert(&self, samples: &[Sample]) -> Result<usize>;

    /// Rows of `tag` with `t0_ns <= timestamp <= t1_ns`, ordered by timestamp
    /// then insertion.
    fn select(&self, tag: &str, t0_ns: i64, t1_ns: i64) -> Result<Vec<StagingRow>>;

    /// Delete exactly these rows. Unknown keys are ignored.
    fn delete(&self, keys: &[RowKey]) -> Result<usize>;

    /// Tags that currently have staged rows.
    fn tags(&self) -> Result<Vec<String>>;

    /// Rows of `tag` strictly older than `before_ns`.
    fn select_before(&self, tag: &str, before_ns: i64) -> Result<Vec<StagingRow>> {
        if before_ns == i64::MIN {
            return Ok(Vec::new());
        }
        self.select(tag, i64::MIN, before_ns - 1)
    }

    /// Newest staged row of `tag`.
    fn latest(&self, tag: &str) -> Result<Option<StagingRow>> {
        Ok(self.select(tag, i64::MIN, i64::MAX)?.pop())
    }

    /// Delete every row older than `before_ns`, or every row when `None`.
    /// Returns the number of rows deleted.
    fn flush(&self, before_ns: Option<i64>) -> Result<usize> {
        let mut deleted = 0;
        for tag in self.tags()? {
            let rows = match before_ns {
                Some(before) => self.select_before(&tag, before)?,
                None => self.select(&tag, i64::MIN, i64::MAX)?,
            };
            let keys: Vec<RowKey> = rows.iter().map(|row| row.key).collect();
            deleted += self.delete(&keys)?;
        }
        Ok(deleted)
    }
}
