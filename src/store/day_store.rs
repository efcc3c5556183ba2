use std::collections::BTreeMap;
use std::path::PathBuf;

use time::Date;

use crate::core::fs::write_atomic;
use crate::core::{DataType, Error, Result, Timezone};
use crate::store::day_file::{self, DayFile};
use crate::store::layout::DayLayout;
use crate::store::series::{clip, coerce_all, normalize, Point};

/// Day-partitioned archive of tag series.
#[derive(Debug, Clone)]
pub struct DayStore {
    layout: DayLayout,
    timezone: Timezone,
}

impl DayStore {
    pub fn new(root: impl Into<PathBuf>, timezone: Timezone) -> Self {
        Self {
            layout: DayLayout::new(root),
            timezone,
        }
    }

    pub fn layout(&self) -> &DayLayout {
        &self.layout
    }

    pub fn timezone(&self) -> Timezone {
        self.timezone
    }

    pub fn days(&self) -> Result<Vec<Date>> {
        self.layout.days()
    }

    /// Points of `tag` for one local day. A missing file is an empty day.
    pub fn load_day(&self, tag: &str, datatype: DataType, day: Date) -> Result<Vec<Point>> {
        let Some(file) = self.read_file(tag, day)? else {
            return Ok(Vec::new());
        };
        let mut points = file.points;
        if file.datatype != datatype {
            let dropped = coerce_all(&mut points, datatype);
            if dropped > 0 {
                log::warn!("{tag}: {dropped} point(s) of {day} could not be read as {datatype}");
            }
        }
        Ok(points)
    }

    /// Decoded day file of `tag`, `None` when it does not exist.
    pub(crate) fn read_file(&self, tag: &str, day: Date) -> Result<Option<DayFile>> {
        let path = self.layout.tag_path_for(day, tag)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        day_file::decode(&bytes)
            .map(Some)
            .map_err(|err| Error::Corrupt(format!("{}: {err}", path.display())))
    }

    /// Replace the day file of `tag` with `points`, already sorted and unique.
    pub(crate) fn write_file(
        &self,
        tag: &str,
        datatype: DataType,
        day: Date,
        points: &[Point],
    ) -> Result<()> {
        let bytes = day_file::encode(datatype, self.timezone.offset_seconds(), points)?;
        let path = self.layout.tag_path_for(day, tag)?;
        write_atomic(&path, &bytes)?;
        log::debug!("{tag}: wrote {} point(s) to {}", points.len(), path.display());
        Ok(())
    }

    /// `[start, end)` of a local day in UTC nanoseconds.
    pub(crate) fn day_bounds(&self, day: Date) -> Result<(i64, i64)> {
        let start = self.timezone.day_start_ns(day)?;
        let end = match day.next_day() {
            Some(next) => self.timezone.day_start_ns(next)?,
            None => i64::MAX,
        };
        Ok((start, end))
    }

    /// Merge `points` into the day file of `tag`. Existing points win on
    /// equal timestamps, so parking the same batch twice is a no-op.
    /// Returns the number of points stored for the day.
    pub fn park(
        &self,
        tag: &str,
        datatype: DataType,
        day: Date,
        points: Vec<Point>,
    ) -> Result<usize> {
        let (start, end) = self.day_bounds(day)?;
        if let Some(outside) = points.iter().find(|p| p.ts_ns < start || p.ts_ns >= end) {
            return Err(Error::Time(format!(
                "{tag}: point at {} is outside {day}",
                outside.ts_ns
            )));
        }

        let mut merged = self.load_day(tag, datatype, day)?;
        if points.is_empty() {
            return Ok(merged.len());
        }
        merged.extend(points);
        normalize(&mut merged);

        self.write_file(tag, datatype, day, &merged)?;
        Ok(merged.len())
    }

    /// Split `points` by local day and park each day. Stops at the first
    /// failing day.
    pub fn park_points(&self, tag: &str, datatype: DataType, points: Vec<Point>) -> Result<()> {
        let mut by_day: BTreeMap<Date, Vec<Point>> = BTreeMap::new();
        for point in points {
            let day = self.timezone.day_of(point.ts_ns)?;
            by_day.entry(day).or_default().push(point);
        }
        for (day, points) in by_day {
            self.park(tag, datatype, day, points)?;
        }
        Ok(())
    }

    /// Archived points of `tag` within `[t0_ns, t1_ns]`, sorted and unique.
    pub fn load_range(
        &self,
        tag: &str,
        datatype: DataType,
        t0_ns: i64,
        t1_ns: i64,
    ) -> Result<Vec<Point>> {
        let mut points = Vec::new();
        for day in self.timezone.days_covering(t0_ns, t1_ns)? {
            points.extend(self.load_day(tag, datatype, day)?);
        }
        normalize(&mut points);
        Ok(clip(points, t0_ns, t1_ns))
    }

    /// Oldest archived point of `tag`.
    pub fn first_point(&self, tag: &str, datatype: DataType) -> Result<Option<Point>> {
        for day in self.days()? {
            let points = self.load_day(tag, datatype, day)?;
            if let Some(point) = points.into_iter().next() {
                return Ok(Some(point));
            }
        }
        Ok(None)
    }

    /// Newest archived point of `tag`.
    pub fn last_point(&self, tag: &str, datatype: DataType) -> Result<Option<Point>> {
        for day in self.days()?.into_iter().rev() {
            let mut points = self.load_day(tag, datatype, day)?;
            if let Some(point) = points.pop() {
                return Ok(Some(point));
            }
        }
        Ok(None)
    }
}
