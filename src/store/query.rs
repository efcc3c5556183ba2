//! Range queries over the archive.
//!
//! A query reads the day files covering `[t0, t1]`, merges recent staging
//! rows when the range reaches into the staging window, resamples every tag
//! and aligns the results on a shared timestamp index.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::catalog::{Tag, TagCatalog};
use crate::core::{Clock, Error, Result, SystemClock, Timezone, Value};
use crate::staging::StagingStore;
use crate::store::coarse::{CoarseCache, CoarseStat};
use crate::store::day_store::DayStore;
use crate::store::resample::{aggregate, auto_bucket_ns, resample, ResampleMethod};
use crate::store::series::{clip, normalize, Point};

/// Staged rows are merged when the query ends within this window of now.
pub const DEFAULT_STAGING_WINDOW: Duration = Duration::from_secs(2 * 86_400);

/// Query result: one column per tag aligned on the sorted union of
/// timestamps. A cell is `None` where the tag has no value at that index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub index: Vec<i64>,
    pub columns: Vec<(String, Vec<Option<Value>>)>,
}

impl Frame {
    pub fn from_series(series: Vec<(String, Vec<Point>)>) -> Self {
        let index: Vec<i64> = series
            .iter()
            .flat_map(|(_, points)| points.iter().map(|p| p.ts_ns))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let columns = series
            .into_iter()
            .map(|(tag, points)| {
                let mut cells = vec![None; index.len()];
                let mut at = 0;
                for point in points {
                    at += index[at..].partition_point(|ts| *ts < point.ts_ns);
                    cells[at] = Some(point.value);
                }
                (tag, cells)
            })
            .collect();

        Self { index, columns }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn column(&self, tag: &str) -> Option<&[Option<Value>]> {
        self.columns
            .iter()
            .find(|(name, _)| name == tag)
            .map(|(_, cells)| cells.as_slice())
    }

    /// Present values of one tag, in index order.
    pub fn series(&self, tag: &str) -> Option<Vec<Point>> {
        let cells = self.column(tag)?;
        Some(
            self.index
                .iter()
                .zip(cells)
                .filter_map(|(ts, cell)| cell.clone().map(|value| Point::new(*ts, value)))
                .collect(),
        )
    }

    /// One CSV row per index entry, timestamps rendered in `timezone`.
    pub fn write_csv<W: io::Write>(&self, writer: W, timezone: Timezone) -> Result<()> {
        let mut csv = csv::WriterBuilder::new().has_headers(false).from_writer(writer);
        let mut header = vec!["timestamp".to_string()];
        header.extend(self.columns.iter().map(|(name, _)| name.clone()));
        csv.write_record(&header).map_err(csv_io)?;

        for (row, ts) in self.index.iter().enumerate() {
            let mut record = Vec::with_capacity(self.columns.len() + 1);
            record.push(timezone.format_timestamp(*ts)?);
            for (_, cells) in &self.columns {
                record.push(cells[row].as_ref().map(Value::to_string).unwrap_or_default());
            }
            csv.write_record(&record).map_err(csv_io)?;
        }
        csv.flush()?;
        Ok(())
    }
}

fn csv_io(err: csv::Error) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, err))
}

pub struct QueryEngine {
    store: DayStore,
    catalog: Arc<TagCatalog>,
    staging: Option<Arc<dyn StagingStore>>,
    coarse: Option<CoarseCache>,
    staging_window_ns: i64,
    workers: usize,
    clock: Arc<dyn Clock>,
}

impl QueryEngine {
    pub fn new(store: DayStore, catalog: Arc<TagCatalog>) -> Self {
        Self {
            store,
            catalog,
            staging: None,
            coarse: None,
            staging_window_ns: duration_ns(DEFAULT_STAGING_WINDOW),
            workers: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_staging(mut self, staging: Arc<dyn StagingStore>) -> Self {
        self.staging = Some(staging);
        self
    }

    pub fn with_coarse(mut self, coarse: CoarseCache) -> Self {
        self.coarse = Some(coarse);
        self
    }

    pub fn with_staging_window(mut self, window: Duration) -> Self {
        self.staging_window_ns = duration_ns(window);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &DayStore {
        &self.store
    }

    /// Load `tags` over `[t0_ns, t1_ns]`, resampled with `method`.
    ///
    /// Without a `bucket` the width is picked by [`auto_bucket_ns`]. Work is
    /// spread over days when the range has more days than tags, over tags
    /// otherwise.
    pub fn load<S: AsRef<str>>(
        &self,
        tags: &[S],
        t0_ns: i64,
        t1_ns: i64,
        method: ResampleMethod,
        bucket: Option<Duration>,
    ) -> Result<Frame> {
        if t1_ns < t0_ns {
            return Err(Error::Time(format!("query ends before it starts: {t0_ns} > {t1_ns}")));
        }
        let tags = tags
            .iter()
            .map(|name| self.catalog.require(name.as_ref()))
            .collect::<Result<Vec<&Tag>>>()?;
        let bucket_ns = match bucket {
            Some(bucket) => duration_ns(bucket),
            None => auto_bucket_ns(t0_ns, t1_ns),
        };
        if bucket_ns <= 0 {
            return Err(Error::Config("query bucket must be positive".to_string()));
        }

        let days = self.store.timezone().days_covering(t0_ns, t1_ns)?.len();
        let by_days = days > tags.len();
        log::debug!(
            "query: {} tag(s) over {days} day(s), {method} every {bucket_ns}ns, parallel by {}",
            tags.len(),
            if by_days { "day" } else { "tag" }
        );

        let columns = if by_days {
            tags.iter()
                .map(|tag| self.series(tag, t0_ns, t1_ns, method, bucket_ns, true))
                .collect::<Result<Vec<_>>>()?
        } else {
            parallel_map(&tags, self.workers, |tag| {
                self.series(tag, t0_ns, t1_ns, method, bucket_ns, false)
            })?
            .into_iter()
            .collect::<Result<Vec<_>>>()?
        };

        Ok(Frame::from_series(
            tags.iter().map(|tag| tag.name.clone()).zip(columns).collect(),
        ))
    }

    /// Newest known value of every tag, from staging or the archive.
    pub fn latest<S: AsRef<str>>(&self, tags: &[S]) -> Result<BTreeMap<String, Option<Point>>> {
        let mut out = BTreeMap::new();
        for name in tags {
            let tag = self.catalog.require(name.as_ref())?;
            let staged = match &self.staging {
                Some(staging) => staging.latest(&tag.name)?.and_then(|row| {
                    row.value
                        .coerce(tag.datatype)
                        .map(|value| Point::new(row.timestamp_ns, value))
                }),
                None => None,
            };
            let archived = self.store.last_point(&tag.name, tag.datatype)?;
            let newest = match (staged, archived) {
                (Some(s), Some(a)) if a.ts_ns > s.ts_ns => Some(a),
                (Some(s), _) => Some(s),
                (None, a) => a,
            };
            out.insert(tag.name.clone(), newest);
        }
        Ok(out)
    }

    fn series(
        &self,
        tag: &Tag,
        t0_ns: i64,
        t1_ns: i64,
        method: ResampleMethod,
        bucket_ns: i64,
        parallel_days: bool,
    ) -> Result<Vec<Point>> {
        let method = method.effective(tag.datatype);
        if let Some(points) = self.from_coarse(tag, t0_ns, t1_ns, method, bucket_ns)? {
            return Ok(points);
        }
        let raw = self.raw(tag, t0_ns, t1_ns, parallel_days)?;
        resample(&raw, method, t0_ns, bucket_ns)
    }

    /// Archived points followed by staged ones; archived values win on
    /// equal timestamps.
    fn raw(&self, tag: &Tag, t0_ns: i64, t1_ns: i64, parallel_days: bool) -> Result<Vec<Point>> {
        let mut points = if parallel_days {
            let days = self.store.timezone().days_covering(t0_ns, t1_ns)?;
            let mut points = Vec::new();
            for day in parallel_map(&days, self.workers, |day| {
                self.store.load_day(&tag.name, tag.datatype, *day)
            })? {
                points.extend(day?);
            }
            normalize(&mut points);
            clip(points, t0_ns, t1_ns)
        } else {
            self.store.load_range(&tag.name, tag.datatype, t0_ns, t1_ns)?
        };

        if let Some(staging) = &self.staging {
            let now = self.clock.now_ns();
            if t1_ns >= now.saturating_sub(self.staging_window_ns) {
                let before = points.len();
                for row in staging.select(&tag.name, t0_ns, t1_ns)? {
                    if let Some(value) = row.value.coerce(tag.datatype) {
                        points.push(Point::new(row.timestamp_ns, value));
                    }
                }
                if points.len() > before {
                    normalize(&mut points);
                }
            }
        }
        Ok(points)
    }

    /// Serve min/max/mean queries from cached minutes plus a raw tail past
    /// the last cached minute. `None` when the cache cannot answer.
    fn from_coarse(
        &self,
        tag: &Tag,
        t0_ns: i64,
        t1_ns: i64,
        method: ResampleMethod,
        bucket_ns: i64,
    ) -> Result<Option<Vec<Point>>> {
        let Some(coarse) = &self.coarse else {
            return Ok(None);
        };
        let Some(stat) = CoarseStat::for_method(method) else {
            return Ok(None);
        };
        if !tag.datatype.is_numeric() || !coarse.covers(t0_ns, bucket_ns) {
            return Ok(None);
        }
        let Some(last_label) = coarse.last_label(&tag.name)? else {
            return Ok(None);
        };

        let mut minutes = coarse.range(stat, &tag.name, t0_ns, t1_ns)?;
        let covered_until = last_label + coarse.resolution_ns();
        if covered_until <= t1_ns {
            let tail = self.raw(tag, covered_until.max(t0_ns), t1_ns, false)?;
            minutes.extend(resample(&tail, stat.method(), 0, coarse.resolution_ns())?);
        }
        log::debug!("{}: {} cached minute(s) used for {method}", tag.name, minutes.len());
        Ok(Some(aggregate(&minutes, method, t0_ns, bucket_ns)?))
    }
}

fn duration_ns(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Map `f` over `items` on up to `workers` named scoped threads, keeping
/// input order.
fn parallel_map<T, R, F>(items: &[T], workers: usize, f: F) -> Result<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let workers = workers.min(items.len());
    if workers <= 1 {
        return Ok(items.iter().map(&f).collect());
    }
    let chunk = items.len().div_ceil(workers);
    thread::scope(|scope| {
        let f = &f;
        let mut handles = Vec::with_capacity(workers);
        for (id, part) in items.chunks(chunk).enumerate() {
            let handle = thread::Builder::new()
                .name(format!("query-worker-{id}"))
                .spawn_scoped(scope, move || part.iter().map(f).collect::<Vec<R>>())?;
            handles.push(handle);
        }
        // join every worker before reporting, a panicked one must not be left
        // for the scope to rethrow
        let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
        let mut out = Vec::with_capacity(items.len());
        for part in joined {
            let part = part.map_err(|_| Error::Worker("query worker panicked".to_string()))?;
            out.extend(part);
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::modbus_tag;
    use crate::core::{parse_day, DataType, ManualClock, NANOS_PER_SEC};
    use crate::staging::{MemoryStaging, Sample};
    use tempfile::tempdir;

    const S: i64 = NANOS_PER_SEC;

    fn engine(root: &std::path::Path, tags: Vec<Tag>) -> QueryEngine {
        let catalog = Arc::new(TagCatalog::new(tags).unwrap());
        QueryEngine::new(DayStore::new(root, Timezone::UTC), catalog).with_workers(4)
    }

    fn day_start(store: &DayStore, day: &str) -> i64 {
        store.timezone().day_start_ns(parse_day(day).unwrap()).unwrap()
    }

    #[test]
    fn frame_aligns_on_union_index() {
        let frame = Frame::from_series(vec![
            ("a".into(), vec![Point::new(1, Value::Int(1)), Point::new(3, Value::Int(3))]),
            ("b".into(), vec![Point::new(2, Value::Int(2)), Point::new(3, Value::Int(30))]),
        ]);
        assert_eq!(frame.index, vec![1, 2, 3]);
        assert_eq!(
            frame.column("a").unwrap(),
            &[Some(Value::Int(1)), None, Some(Value::Int(3))]
        );
        assert_eq!(frame.series("b").unwrap().len(), 2);
        assert!(frame.column("c").is_none());

        let mut out = Vec::new();
        frame.write_csv(&mut out, Timezone::UTC).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "timestamp,a,b");
        assert!(lines[2].ends_with(",,2"));
    }

    #[test]
    fn parallel_map_keeps_order() {
        let items: Vec<u32> = (0..37).collect();
        let out = parallel_map(&items, 4, |x| x * 2).unwrap();
        assert_eq!(out, items.iter().map(|x| x * 2).collect::<Vec<_>>());
        assert!(parallel_map(&[] as &[u32], 4, |x| *x).unwrap().is_empty());
    }

    #[test]
    fn spans_days_and_merges_staging() {
        let dir = tempdir().expect("tempdir");
        let staging = Arc::new(MemoryStaging::new());
        let clock = ManualClock::new(0);
        let engine = engine(dir.path(), vec![modbus_tag("flow", "plc", 0, 5)])
            .with_staging(staging.clone())
            .with_clock(Arc::new(clock.clone()));
        let d1 = day_start(engine.store(), "2024-03-01");
        let d2 = day_start(engine.store(), "2024-03-02");
        let store = engine.store();
        store
            .park_points(
                "flow",
                DataType::Float,
                vec![
                    Point::new(d2 - 10 * S, Value::Float(1.0)),
                    Point::new(d2 + 10 * S, Value::Float(2.0)),
                ],
            )
            .unwrap();
        staging
            .insert(&[
                Sample::new("flow", Value::Float(99.0), d2 + 10 * S),
                Sample::new("flow", Value::Float(3.0), d2 + 20 * S),
            ])
            .unwrap();
        clock.set(d2 + 30 * S);

        let frame = engine
            .load(&["flow"], d1, d2 + 30 * S, ResampleMethod::Raw, None)
            .unwrap();
        let values: Vec<f64> = frame
            .series("flow")
            .unwrap()
            .iter()
            .map(|p| p.value.as_f64().unwrap())
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);

        // outside the staging window only archived data is visible
        let frame = engine
            .with_staging_window(Duration::from_secs(1))
            .load(&["flow"], d1, d2 + 25 * S, ResampleMethod::Raw, None)
            .unwrap();
        assert_eq!(frame.len(), 2);
    }

    #[test]
    fn latest_prefers_the_newest_source() {
        let dir = tempdir().expect("tempdir");
        let staging = Arc::new(MemoryStaging::new());
        let engine = engine(
            dir.path(),
            vec![modbus_tag("flow", "plc", 0, 5), modbus_tag("idle", "plc", 2, 5)],
        )
        .with_staging(staging.clone());
        let d = day_start(engine.store(), "2024-03-01");
        engine
            .store()
            .park_points("flow", DataType::Float, vec![Point::new(d, Value::Float(1.0))])
            .unwrap();
        staging
            .insert(&[Sample::new("flow", Value::Float(2.0), d + S)])
            .unwrap();

        let latest = engine.latest(&["flow", "idle"]).unwrap();
        assert_eq!(latest["flow"], Some(Point::new(d + S, Value::Float(2.0))));
        assert_eq!(latest["idle"], None);
        assert!(engine.latest(&["missing"]).is_err());
    }

    #[test]
    fn rejects_inverted_ranges_and_unknown_tags() {
        let dir = tempdir().expect("tempdir");
        let engine = engine(dir.path(), vec![modbus_tag("flow", "plc", 0, 5)]);
        assert!(engine.load(&["flow"], 10, 0, ResampleMethod::Mean, None).is_err());
        assert!(engine.load(&["nope"], 0, 10, ResampleMethod::Mean, None).is_err());
        assert!(engine
            .load(&["flow"], 0, 10, ResampleMethod::Mean, Some(Duration::ZERO))
            .is_err());
    }
}
