//! Pre-aggregated one-minute statistics.
//!
//! Each statistic lives in `<root>/<stat>/<tag>` using the day-file
//! container, with labels aligned to the epoch minute. Updates restart from
//! the last cached label, so a minute that was still filling during the
//! previous update is recomputed and replaced.

use std::path::{Path, PathBuf};

use crate::catalog::{Tag, TagCatalog};
use crate::core::fs::write_atomic;
use crate::core::{DataType, Result, NANOS_PER_SEC};
use crate::store::day_file;
use crate::store::day_store::DayStore;
use crate::store::layout::validate_component;
use crate::store::resample::{resample, ResampleMethod};
use crate::store::series::{clip, Point};

pub const COARSE_RESOLUTION_NS: i64 = 60 * NANOS_PER_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoarseStat {
    Mean,
    Min,
    Max,
}

impl CoarseStat {
    pub const ALL: [CoarseStat; 3] = [CoarseStat::Mean, CoarseStat::Min, CoarseStat::Max];

    pub fn as_str(&self) -> &'static str {
        match self {
            CoarseStat::Mean => "mean",
            CoarseStat::Min => "min",
            CoarseStat::Max => "max",
        }
    }

    pub fn method(&self) -> ResampleMethod {
        match self {
            CoarseStat::Mean => ResampleMethod::Mean,
            CoarseStat::Min => ResampleMethod::Min,
            CoarseStat::Max => ResampleMethod::Max,
        }
    }

    pub fn for_method(method: ResampleMethod) -> Option<CoarseStat> {
        match method {
            ResampleMethod::Mean => Some(CoarseStat::Mean),
            ResampleMethod::Min => Some(CoarseStat::Min),
            ResampleMethod::Max => Some(CoarseStat::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoarseReport {
    pub tags_updated: usize,
    pub buckets_written: usize,
    pub failed_tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CoarseCache {
    root: PathBuf,
    resolution_ns: i64,
}

impl CoarseCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            resolution_ns: COARSE_RESOLUTION_NS,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolution_ns(&self) -> i64 {
        self.resolution_ns
    }

    /// Whether a query starting at `t0_ns` with `bucket_ns` buckets can be
    /// answered from cached minutes.
    pub fn covers(&self, t0_ns: i64, bucket_ns: i64) -> bool {
        bucket_ns >= self.resolution_ns
            && bucket_ns % self.resolution_ns == 0
            && t0_ns.rem_euclid(self.resolution_ns) == 0
    }

    fn path(&self, stat: CoarseStat, tag: &str) -> Result<PathBuf> {
        validate_component("tag", tag)?;
        Ok(self.root.join(stat.as_str()).join(tag))
    }

    pub fn load(&self, stat: CoarseStat, tag: &str) -> Result<Vec<Point>> {
        let path = self.path(stat, tag)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(day_file::decode(&bytes)?.points),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Cached minutes of `stat` within `[t0_ns, t1_ns]`.
    pub fn range(&self, stat: CoarseStat, tag: &str, t0_ns: i64, t1_ns: i64) -> Result<Vec<Point>> {
        Ok(clip(self.load(stat, tag)?, t0_ns, t1_ns))
    }

    /// Drop every cached stat of `tag`. Returns the number of files removed.
    pub fn remove_tag(&self, tag: &str) -> Result<usize> {
        let mut removed = 0;
        for stat in CoarseStat::ALL {
            match std::fs::remove_file(self.path(stat, tag)?) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(removed)
    }

    pub fn last_label(&self, tag: &str) -> Result<Option<i64>> {
        Ok(self.load(CoarseStat::Mean, tag)?.last().map(|p| p.ts_ns))
    }

    /// Bring the cache of `tag` up to the last complete minute before
    /// `now_ns`. Returns the number of minutes (re)written.
    pub fn update_tag(&self, store: &DayStore, tag: &Tag, now_ns: i64) -> Result<usize> {
        let res = self.resolution_ns;
        let end = now_ns.div_euclid(res) * res;
        let start = match self.last_label(&tag.name)? {
            Some(label) => label,
            None => match store.first_point(&tag.name, tag.datatype)? {
                Some(point) => point.ts_ns.div_euclid(res) * res,
                None => return Ok(0),
            },
        };
        if end <= start {
            return Ok(0);
        }

        let raw = store.load_range(&tag.name, tag.datatype, start, end - 1)?;
        if raw.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        for stat in CoarseStat::ALL {
            // text and bool minutes carry the value in force
            let (method, file_type) = if tag.datatype.is_numeric() {
                (stat.method(), DataType::Float)
            } else {
                (ResampleMethod::ForwardFill, tag.datatype)
            };
            let fresh = resample(&raw, method, 0, res)?;
            let Some(first) = fresh.first() else {
                continue;
            };
            let mut merged = self.load(stat, &tag.name)?;
            let first_label = first.ts_ns;
            merged.retain(|p| p.ts_ns < first_label);
            written = written.max(fresh.len());
            merged.extend(fresh);

            let bytes = day_file::encode(file_type, 0, &merged)?;
            write_atomic(&self.path(stat, &tag.name)?, &bytes)?;
        }
        log::debug!("{}: coarse cache updated, {written} minute(s)", tag.name);
        Ok(written)
    }

    /// Update every catalog tag. Failures are logged and reported, the
    /// remaining tags still run.
    pub fn update_all(&self, store: &DayStore, catalog: &TagCatalog, now_ns: i64) -> CoarseReport {
        let mut report = CoarseReport::default();
        for tag in catalog.tags() {
            match self.update_tag(store, tag, now_ns) {
                Ok(0) => {}
                Ok(written) => {
                    report.tags_updated += 1;
                    report.buckets_written += written;
                }
                Err(err) => {
                    log::warn!("{}: coarse update failed: {err}", tag.name);
                    report.failed_tags.push(tag.name.clone());
                }
            }
        }
        log::info!(
            "coarse cache: {} tag(s) updated, {} minute(s) written, {} failed",
            report.tags_updated,
            report.buckets_written,
            report.failed_tags.len()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::modbus_tag;
    use crate::core::{parse_day, Timezone, Value};
    use tempfile::tempdir;

    const S: i64 = NANOS_PER_SEC;

    fn quarters(base_secs: i64, minutes: std::ops::Range<i64>) -> Vec<Point> {
        minutes
            .flat_map(|m| (0..4).map(move |q| (m, q)))
            .map(|(m, q)| Point::new((base_secs + m * 60 + q * 15) * S, Value::Float((q + 1) as f64)))
            .collect()
    }

    fn values(points: &[Point]) -> Vec<f64> {
        points.iter().map(|p| p.value.as_f64().unwrap()).collect()
    }

    #[test]
    fn recomputes_the_last_minute() {
        let dir = tempdir().expect("tempdir");
        let store = DayStore::new(dir.path().join("store"), Timezone::UTC);
        let cache = CoarseCache::new(dir.path().join("coarse"));
        let tag = modbus_tag("flow", "plc", 0, 5);
        let base = store
            .timezone()
            .day_start_ns(parse_day("2024-03-01").unwrap())
            .unwrap()
            / S;

        // minute 2 is only half in when the cache is first built
        let mut early = quarters(base, 0..3);
        let late = early.split_off(10);
        store.park_points("flow", tag.datatype, early).unwrap();
        assert_eq!(cache.update_tag(&store, &tag, (base + 180) * S).unwrap(), 3);
        assert_eq!(values(&cache.load(CoarseStat::Mean, "flow").unwrap()), vec![2.5, 2.5, 1.75]);
        assert_eq!(values(&cache.load(CoarseStat::Min, "flow").unwrap()), vec![1.0; 3]);
        assert_eq!(values(&cache.load(CoarseStat::Max, "flow").unwrap()), vec![4.0, 4.0, 2.0]);
        assert_eq!(cache.last_label("flow").unwrap(), Some((base + 120) * S));

        store.park_points("flow", tag.datatype, late).unwrap();
        store
            .park_points("flow", tag.datatype, quarters(base, 3..4))
            .unwrap();
        assert_eq!(cache.update_tag(&store, &tag, (base + 240) * S).unwrap(), 2);
        assert_eq!(values(&cache.load(CoarseStat::Mean, "flow").unwrap()), vec![2.5; 4]);
        assert_eq!(values(&cache.load(CoarseStat::Max, "flow").unwrap()), vec![4.0; 4]);
        // nothing new
        assert_eq!(cache.update_tag(&store, &tag, (base + 200) * S).unwrap(), 0);

        assert_eq!(cache.remove_tag("flow").unwrap(), 3);
        assert_eq!(cache.remove_tag("flow").unwrap(), 0);
        assert_eq!(cache.last_label("flow").unwrap(), None);
    }

    #[test]
    fn empty_store_and_eligibility() {
        let dir = tempdir().expect("tempdir");
        let store = DayStore::new(dir.path().join("store"), Timezone::UTC);
        let cache = CoarseCache::new(dir.path().join("coarse"));
        let tag = modbus_tag("flow", "plc", 0, 5);
        assert_eq!(cache.update_tag(&store, &tag, 10_000 * S).unwrap(), 0);
        assert!(cache.load(CoarseStat::Mean, "flow").unwrap().is_empty());

        assert!(cache.covers(0, 300 * S));
        assert!(!cache.covers(0, 30 * S));
        assert!(!cache.covers(0, 90 * S));
        assert!(!cache.covers(5 * S, 60 * S));
    }
}
