//! Housekeeping of the day store: listing what is parked, removing tags and
//! repairing day files written under another datatype or timezone.

use std::time::Duration;

use time::Date;

use crate::catalog::Tag;
use crate::core::{format_day, DataType, Result};
use crate::store::day_store::DayStore;
use crate::store::series::{coerce_all, normalize, Point};

/// One parked day and what it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySummary {
    pub day: Date,
    pub tags: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub files_checked: usize,
    pub files_rewritten: usize,
    /// Points that could not be coerced or shared a timestamp with an
    /// earlier point.
    pub points_dropped: usize,
    /// Points that belonged to another local day and were parked there.
    pub points_moved: usize,
    /// `<day>/<tag>` of every file that could not be repaired.
    pub failed: Vec<String>,
}

impl DayStore {
    /// Days with at least one tag file and more than `min_bytes` of day
    /// files, oldest first.
    pub fn parked_days(&self, min_bytes: u64) -> Result<Vec<DaySummary>> {
        let mut out = Vec::new();
        for day in self.days()? {
            let tags = self.layout().tags_of(day)?;
            let mut bytes = 0;
            for tag in &tags {
                bytes += std::fs::metadata(self.layout().tag_path_for(day, tag)?)?.len();
            }
            if !tags.is_empty() && bytes > min_bytes {
                out.push(DaySummary {
                    day,
                    tags: tags.len(),
                    bytes,
                });
            }
        }
        Ok(out)
    }

    /// A `span`-wide range ending at the newest archived point of any tag.
    /// `None` when nothing is archived.
    pub fn auto_time_range(&self, span: Duration) -> Result<Option<(i64, i64)>> {
        let span_ns = i64::try_from(span.as_nanos()).unwrap_or(i64::MAX);
        for summary in self.parked_days(0)?.into_iter().rev() {
            let mut newest: Option<i64> = None;
            for tag in self.layout().tags_of(summary.day)? {
                let Some(file) = self.read_file(&tag, summary.day)? else {
                    continue;
                };
                if let Some(last) = file.points.iter().map(|p| p.ts_ns).max() {
                    newest = Some(newest.map_or(last, |n| n.max(last)));
                }
            }
            if let Some(t1) = newest {
                return Ok(Some((t1.saturating_sub(span_ns), t1)));
            }
        }
        Ok(None)
    }

    /// Delete the day files of `tags` on every day within `range`
    /// (inclusive), or on every day. Returns the number of files removed.
    pub fn remove_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
        range: Option<(Date, Date)>,
    ) -> Result<usize> {
        let mut removed = 0;
        for day in self.days_within(range)? {
            for tag in tags {
                let path = self.layout().tag_path_for(day, tag.as_ref())?;
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        removed += 1;
                        log::debug!("removed {}", path.display());
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        log::info!("removed {removed} day file(s) of {} tag(s)", tags.len());
        Ok(removed)
    }

    /// Rewrite the day files of `tags` so each one is sorted, unique, typed
    /// as its tag and split on the store timezone's days. Files that already
    /// are stay untouched. A failing file is reported and skipped.
    pub fn repair(&self, tags: &[Tag], range: Option<(Date, Date)>) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        for day in self.days_within(range)? {
            for tag in tags {
                if let Err(err) = self.repair_file(&tag.name, tag.datatype, day, &mut report) {
                    log::warn!("{}: repair of {day} failed: {err}", tag.name);
                    report.failed.push(format!("{}/{}", format_day(day), tag.name));
                }
            }
        }
        log::info!(
            "repair: {} of {} file(s) rewritten, {} point(s) dropped, {} moved, {} failed",
            report.files_rewritten,
            report.files_checked,
            report.points_dropped,
            report.points_moved,
            report.failed.len()
        );
        Ok(report)
    }

    fn repair_file(
        &self,
        tag: &str,
        datatype: DataType,
        day: Date,
        report: &mut RepairReport,
    ) -> Result<()> {
        let Some(file) = self.read_file(tag, day)? else {
            return Ok(());
        };
        report.files_checked += 1;
        let mut points = file.points;
        let read = points.len();
        let ordered = points.windows(2).all(|w| w[0].ts_ns < w[1].ts_ns);
        let uncoerced = coerce_all(&mut points, datatype);
        normalize(&mut points);
        let (start, end) = self.day_bounds(day)?;
        let (inside, outside): (Vec<Point>, Vec<Point>) = points
            .into_iter()
            .partition(|p| p.ts_ns >= start && p.ts_ns < end);

        if file.datatype == datatype
            && file.tz_offset_secs == self.timezone().offset_seconds()
            && ordered
            && uncoerced == 0
            && outside.is_empty()
        {
            return Ok(());
        }

        let dropped = read - inside.len() - outside.len();
        if inside.is_empty() {
            std::fs::remove_file(self.layout().tag_path_for(day, tag)?)?;
        } else {
            self.write_file(tag, datatype, day, &inside)?;
        }
        let moved = outside.len();
        if moved > 0 {
            self.park_points(tag, datatype, outside)?;
        }
        log::info!("{tag}: repaired {day}, {dropped} point(s) dropped, {moved} moved");
        report.files_rewritten += 1;
        report.points_dropped += dropped;
        report.points_moved += moved;
        Ok(())
    }

    fn days_within(&self, range: Option<(Date, Date)>) -> Result<Vec<Date>> {
        let mut days = self.days()?;
        if let Some((first, last)) = range {
            days.retain(|day| (first..=last).contains(day));
        }
        Ok(days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{TagAddress, TagCatalog};
    use crate::core::{parse_day, Timezone, Value, NANOS_PER_SEC};
    use crate::store::day_file;
    use tempfile::tempdir;

    const S: i64 = NANOS_PER_SEC;

    fn tag(name: &str, datatype: DataType) -> Tag {
        Tag {
            name: name.to_string(),
            description: String::new(),
            unit: String::new(),
            datatype,
            frequency_secs: 10,
            device: "plc".to_string(),
            address: TagAddress::Symbol {
                symbol: name.to_string(),
            },
        }
    }

    fn utc(value: &str) -> Result<i64> {
        Timezone::UTC.parse_timestamp(value)
    }

    #[test]
    fn lists_parked_days_and_picks_a_recent_range() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DayStore::new(dir.path(), Timezone::UTC);
        assert_eq!(store.auto_time_range(Duration::from_secs(8 * 3600))?, None);

        let first = utc("2024-03-01T10:00:00Z")?;
        let last = utc("2024-03-02T06:30:00Z")?;
        store.park_points("a", DataType::Float, vec![Point::new(first, Value::Float(1.0))])?;
        store.park_points(
            "b",
            DataType::Int,
            vec![Point::new(first, Value::Int(1)), Point::new(last, Value::Int(2))],
        )?;
        std::fs::create_dir_all(dir.path().join("2024-03-03"))?;

        let days = store.parked_days(0)?;
        let listed: Vec<(String, usize)> = days
            .iter()
            .map(|d| (format_day(d.day), d.tags))
            .collect();
        assert_eq!(
            listed,
            vec![("2024-03-01".to_string(), 2), ("2024-03-02".to_string(), 1)]
        );
        assert!(days.iter().all(|d| d.bytes > 0));
        assert!(store.parked_days(u64::MAX)?.is_empty());

        assert_eq!(
            store.auto_time_range(Duration::from_secs(8 * 3600))?,
            Some((last - 8 * 3600 * S, last))
        );
        Ok(())
    }

    #[test]
    fn removes_tags_on_selected_days() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DayStore::new(dir.path(), Timezone::UTC);
        let day1 = parse_day("2024-03-01")?;
        let day2 = parse_day("2024-03-02")?;
        for name in ["a", "b"] {
            store.park_points(
                name,
                DataType::Int,
                vec![
                    Point::new(utc("2024-03-01T12:00:00Z")?, Value::Int(1)),
                    Point::new(utc("2024-03-02T12:00:00Z")?, Value::Int(2)),
                ],
            )?;
        }

        assert_eq!(store.remove_tags(&["a"], Some((day1, day1)))?, 1);
        assert!(store.load_day("a", DataType::Int, day1)?.is_empty());
        assert_eq!(store.load_day("a", DataType::Int, day2)?.len(), 1);

        assert_eq!(store.remove_tags(&["a", "missing"], None)?, 1);
        assert!(store.load_day("a", DataType::Int, day2)?.is_empty());
        assert_eq!(store.load_day("b", DataType::Int, day1)?.len(), 1);
        assert!(store.remove_tags(&["../b"], None).is_err());
        Ok(())
    }

    #[test]
    fn repair_retypes_dedupes_and_moves_points_to_their_day() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DayStore::new(dir.path(), Timezone::FixedOffset(3600));
        let day1 = parse_day("2024-03-01")?;
        let day2 = parse_day("2024-03-02")?;

        // written as ints by a UTC store, unsorted, with a duplicate
        let legacy = vec![
            Point::new(utc("2024-03-01T00:00:00Z")?, Value::Int(1)),
            Point::new(utc("2024-03-01T12:00:00Z")?, Value::Int(2)),
            Point::new(utc("2024-03-01T12:00:00Z")?, Value::Int(99)),
            Point::new(utc("2024-03-01T06:00:00Z")?, Value::Int(3)),
            Point::new(utc("2024-03-01T23:30:00Z")?, Value::Int(4)),
        ];
        let path = store.layout().tag_path_for(day1, "flow")?;
        std::fs::create_dir_all(path.parent().expect("day dir"))?;
        std::fs::write(&path, day_file::encode(DataType::Int, 0, &legacy)?)?;

        // a float file holding a NaN
        let bad = vec![
            Point::new(utc("2024-03-01T01:00:00Z")?, Value::Float(f64::NAN)),
            Point::new(utc("2024-03-01T02:00:00Z")?, Value::Float(2.0)),
        ];
        let bad_path = store.layout().tag_path_for(day1, "level")?;
        std::fs::write(&bad_path, day_file::encode(DataType::Float, 3600, &bad)?)?;

        let catalog = TagCatalog::new(vec![
            tag("flow", DataType::Float),
            tag("level", DataType::Float),
            tag("idle", DataType::Float),
        ])?;
        let report = store.repair(catalog.tags(), None)?;
        assert_eq!(report.files_checked, 2);
        assert_eq!(report.files_rewritten, 2);
        assert_eq!(report.points_dropped, 2);
        assert_eq!(report.points_moved, 1);
        assert!(report.failed.is_empty());

        let values: Vec<Value> = store
            .load_day("flow", DataType::Float, day1)?
            .into_iter()
            .map(|p| p.value)
            .collect();
        assert_eq!(values, vec![Value::Float(1.0), Value::Float(3.0), Value::Float(2.0)]);
        assert_eq!(
            store.load_day("flow", DataType::Float, day2)?,
            vec![Point::new(utc("2024-03-01T23:30:00Z")?, Value::Float(4.0))]
        );
        assert_eq!(store.load_day("level", DataType::Float, day1)?.len(), 1);

        let again = store.repair(catalog.tags(), None)?;
        assert_eq!(again.files_checked, 3);
        assert_eq!(again.files_rewritten, 0);
        Ok(())
    }

    #[test]
    fn corrupt_files_are_reported_not_fatal() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let store = DayStore::new(dir.path(), Timezone::UTC);
        let day = parse_day("2024-03-01")?;
        let path = store.layout().tag_path_for(day, "flow")?;
        std::fs::create_dir_all(path.parent().expect("day dir"))?;
        std::fs::write(&path, b"not a day file")?;

        let report = store.repair(&[tag("flow", DataType::Float)], Some((day, day)))?;
        assert_eq!(report.failed, vec!["2024-03-01/flow".to_string()]);
        assert_eq!(report.files_rewritten, 0);
        Ok(())
    }
}
