//! Resampling of one tag series onto a bucket grid.
//!
//! The grid starts at the query start `t0`. Buckets are left-closed and
//! labelled by their left edge; labels run from the first bucket holding a
//! sample to the last one.

use std::fmt;
use std::str::FromStr;

use crate::core::{DataType, Error, Result, Value, NANOS_PER_SEC};
use crate::store::series::Point;

/// [`ResampleMethod::Mean`] buckets up to this width take the plain mean of
/// their samples; wider ones are time-weighted.
pub const FINE_STEP_NS: i64 = 100_000_000;
pub const DEFAULT_ROLLING_WINDOW_SECS: u64 = 3000;
const TARGET_BUCKETS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResampleMethod {
    Raw,
    Nearest,
    ForwardFill,
    Mean,
    Min,
    Max,
    Median,
    LinearInterpolate,
    RollingMean { window_secs: u64 },
}

impl ResampleMethod {
    /// Method actually applied to a tag of `datatype`. Text and bool series
    /// cannot be averaged: they keep `Raw` and `ForwardFill`, anything else
    /// becomes `Nearest`.
    pub fn effective(self, datatype: DataType) -> ResampleMethod {
        if datatype.is_numeric() {
            return self;
        }
        match self {
            ResampleMethod::Raw => ResampleMethod::Raw,
            ResampleMethod::ForwardFill => ResampleMethod::ForwardFill,
            _ => ResampleMethod::Nearest,
        }
    }
}

impl FromStr for ResampleMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        if let Some(window) = lower
            .strip_prefix("rolling_mean:")
            .or_else(|| lower.strip_prefix("rolling:"))
        {
            let window_secs: u64 = window
                .parse()
                .map_err(|_| Error::Config(format!("bad rolling window {window:?}")))?;
            if window_secs == 0 {
                return Err(Error::Config("rolling window must be positive".to_string()));
            }
            return Ok(ResampleMethod::RollingMean { window_secs });
        }
        match lower.as_str() {
            "raw" => Ok(ResampleMethod::Raw),
            "nearest" => Ok(ResampleMethod::Nearest),
            "ffill" | "forward_fill" | "forwardfill" => Ok(ResampleMethod::ForwardFill),
            "mean" => Ok(ResampleMethod::Mean),
            "min" => Ok(ResampleMethod::Min),
            "max" => Ok(ResampleMethod::Max),
            "median" => Ok(ResampleMethod::Median),
            "interpolate" | "linear" => Ok(ResampleMethod::LinearInterpolate),
            "rolling_mean" | "rolling" => Ok(ResampleMethod::RollingMean {
                window_secs: DEFAULT_ROLLING_WINDOW_SECS,
            }),
            _ => Err(Error::Config(format!("unknown resample method {s:?}"))),
        }
    }
}

impl fmt::Display for ResampleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResampleMethod::Raw => f.write_str("raw"),
            ResampleMethod::Nearest => f.write_str("nearest"),
            ResampleMethod::ForwardFill => f.write_str("ffill"),
            ResampleMethod::Mean => f.write_str("mean"),
            ResampleMethod::Min => f.write_str("min"),
            ResampleMethod::Max => f.write_str("max"),
            ResampleMethod::Median => f.write_str("median"),
            ResampleMethod::LinearInterpolate => f.write_str("interpolate"),
            ResampleMethod::RollingMean { window_secs } => write!(f, "rolling_mean:{window_secs}"),
        }
    }
}

/// Bucket width when the caller gives none: roughly 500 buckets over the
/// range, never below one second.
pub fn auto_bucket_ns(t0_ns: i64, t1_ns: i64) -> i64 {
    let span = t1_ns.saturating_sub(t0_ns).max(0);
    (span / TARGET_BUCKETS).max(NANOS_PER_SEC)
}

/// Resample sorted, deduplicated points lying in `[t0_ns, ..]`.
pub fn resample(
    points: &[Point],
    method: ResampleMethod,
    t0_ns: i64,
    bucket_ns: i64,
) -> Result<Vec<Point>> {
    if bucket_ns <= 0 {
        return Err(Error::Config(format!("bucket must be positive, got {bucket_ns}ns")));
    }
    if method == ResampleMethod::Raw {
        return Ok(points.to_vec());
    }
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return Ok(Vec::new());
    };
    let grid = Grid {
        origin: t0_ns,
        step: bucket_ns,
    };
    let first_bucket = grid.index(first.ts_ns);
    let last_bucket = grid.index(last.ts_ns);
    let labels = (first_bucket..=last_bucket).map(|k| grid.label(k));

    let out = match method {
        ResampleMethod::Raw => points.to_vec(),
        ResampleMethod::Nearest => labels
            .filter_map(|label| nearest(points, label).map(|p| Point::new(label, p.value.clone())))
            .collect(),
        ResampleMethod::ForwardFill => labels
            .filter_map(|label| at_or_before(points, label).map(|p| Point::new(label, p.value.clone())))
            .collect(),
        ResampleMethod::LinearInterpolate => labels
            .filter_map(|label| interpolate(points, label).map(|v| Point::new(label, Value::Float(v))))
            .collect(),
        ResampleMethod::RollingMean { window_secs } => {
            let window = i64::try_from(window_secs)
                .unwrap_or(i64::MAX / NANOS_PER_SEC)
                .saturating_mul(NANOS_PER_SEC);
            labels
                .filter_map(|label| {
                    let lo = points.partition_point(|p| p.ts_ns <= label.saturating_sub(window));
                    let hi = points.partition_point(|p| p.ts_ns <= label);
                    mean_of(&points[lo..hi]).map(|v| Point::new(label, Value::Float(v)))
                })
                .collect()
        }
        ResampleMethod::Mean if bucket_ns > FINE_STEP_NS => held_mean(points, &grid),
        ResampleMethod::Mean => per_bucket(points, &grid, mean_of),
        ResampleMethod::Min => per_bucket(points, &grid, |bucket| {
            numeric(bucket).reduce(f64::min)
        }),
        ResampleMethod::Max => per_bucket(points, &grid, |bucket| {
            numeric(bucket).reduce(f64::max)
        }),
        ResampleMethod::Median => per_bucket(points, &grid, median_of),
    };
    Ok(out)
}

/// Reduce already bucketed values into wider buckets. Unlike [`resample`],
/// `Mean` is the plain mean of the inputs: they are coarse-cache means at a
/// regular step, so they already carry equal weight.
pub fn aggregate(
    points: &[Point],
    method: ResampleMethod,
    t0_ns: i64,
    bucket_ns: i64,
) -> Result<Vec<Point>> {
    if bucket_ns <= 0 {
        return Err(Error::Config(format!("bucket must be positive, got {bucket_ns}ns")));
    }
    let grid = Grid {
        origin: t0_ns,
        step: bucket_ns,
    };
    match method {
        ResampleMethod::Mean => Ok(per_bucket(points, &grid, mean_of)),
        ResampleMethod::Median => Ok(per_bucket(points, &grid, median_of)),
        ResampleMethod::Min => Ok(per_bucket(points, &grid, |b| numeric(b).reduce(f64::min))),
        ResampleMethod::Max => Ok(per_bucket(points, &grid, |b| numeric(b).reduce(f64::max))),
        other => resample(points, other, t0_ns, bucket_ns),
    }
}

#[derive(Debug, Clone, Copy)]
struct Grid {
    origin: i64,
    step: i64,
}

impl Grid {
    fn index(&self, ts_ns: i64) -> i64 {
        (ts_ns - self.origin).div_euclid(self.step)
    }

    fn label(&self, index: i64) -> i64 {
        self.origin + index * self.step
    }
}

fn numeric(points: &[Point]) -> impl Iterator<Item = f64> + '_ {
    points.iter().filter_map(|p| p.value.as_f64())
}

fn mean_of(points: &[Point]) -> Option<f64> {
    let (sum, count) = numeric(points).fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

fn median_of(points: &[Point]) -> Option<f64> {
    let mut values: Vec<f64> = numeric(points).collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Apply `reduce` to the samples of every non-empty bucket.
fn per_bucket<F>(points: &[Point], grid: &Grid, reduce: F) -> Vec<Point>
where
    F: Fn(&[Point]) -> Option<f64>,
{
    let mut out = Vec::new();
    let mut start = 0;
    while start < points.len() {
        let bucket = grid.index(points[start].ts_ns);
        let end = start + points[start..].partition_point(|p| grid.index(p.ts_ns) == bucket);
        if let Some(value) = reduce(&points[start..end]) {
            out.push(Point::new(grid.label(bucket), Value::Float(value)));
        }
        start = end;
    }
    out
}

/// Time-weighted mean. Every sample holds its value until the next sample,
/// the last one until the end of its bucket, and weighs by how long it holds
/// inside each bucket it covers. This is upsampling with forward fill onto an
/// arbitrarily fine grid, computed in one pass over samples and buckets.
fn held_mean(points: &[Point], grid: &Grid) -> Vec<Point> {
    let finish = |(bucket, sum, weight): (i64, f64, f64)| {
        Point::new(grid.label(bucket), Value::Float(sum / weight))
    };
    let mut out = Vec::new();
    // (bucket, sum of value * held ns, held ns)
    let mut current: Option<(i64, f64, f64)> = None;
    for (i, point) in points.iter().enumerate() {
        let Some(value) = point.value.as_f64() else {
            continue;
        };
        let until = match points.get(i + 1) {
            Some(next) => next.ts_ns,
            None => grid.label(grid.index(point.ts_ns) + 1),
        };
        let mut from = point.ts_ns;
        while from < until {
            let bucket = grid.index(from);
            let to = until.min(grid.label(bucket + 1));
            let held = (to - from) as f64;
            match current.as_mut() {
                Some((b, sum, weight)) if *b == bucket => {
                    *sum += value * held;
                    *weight += held;
                }
                _ => {
                    if let Some(done) = current.take() {
                        out.push(finish(done));
                    }
                    current = Some((bucket, value * held, held));
                }
            }
            from = to;
        }
    }
    if let Some(done) = current {
        out.push(finish(done));
    }
    out
}

fn at_or_before(points: &[Point], ts_ns: i64) -> Option<&Point> {
    let idx = points.partition_point(|p| p.ts_ns <= ts_ns);
    idx.checked_sub(1).map(|i| &points[i])
}

fn nearest(points: &[Point], ts_ns: i64) -> Option<&Point> {
    let idx = points.partition_point(|p| p.ts_ns < ts_ns);
    let after = points.get(idx);
    let before = idx.checked_sub(1).and_then(|i| points.get(i));
    match (before, after) {
        (Some(b), Some(a)) => {
            if a.ts_ns - ts_ns < ts_ns - b.ts_ns {
                Some(a)
            } else {
                Some(b)
            }
        }
        (Some(b), None) => Some(b),
        (None, a) => a,
    }
}

fn interpolate(points: &[Point], ts_ns: i64) -> Option<f64> {
    let idx = points.partition_point(|p| p.ts_ns <= ts_ns);
    let before = idx.checked_sub(1).and_then(|i| points.get(i));
    let after = points.get(idx);
    match (before, after) {
        (Some(b), Some(a)) => {
            let (vb, va) = (b.value.as_f64()?, a.value.as_f64()?);
            let frac = (ts_ns - b.ts_ns) as f64 / (a.ts_ns - b.ts_ns) as f64;
            Some(vb + (va - vb) * frac)
        }
        (Some(b), None) => b.value.as_f64(),
        (None, Some(a)) => a.value.as_f64(),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: i64 = NANOS_PER_SEC;

    fn f(ts_secs: i64, v: f64) -> Point {
        Point::new(ts_secs * S, Value::Float(v))
    }

    fn values(points: &[Point]) -> Vec<(i64, f64)> {
        points
            .iter()
            .map(|p| (p.ts_ns / S, p.value.as_f64().unwrap()))
            .collect()
    }

    /// [1, 2, 3, 4] every 15 seconds, repeated for `minutes`.
    fn quarter_pattern(minutes: i64) -> Vec<Point> {
        (0..minutes * 4)
            .map(|i| f(i * 15, (i % 4 + 1) as f64))
            .collect()
    }

    #[test]
    fn parses_methods() {
        assert_eq!("MEAN".parse::<ResampleMethod>().unwrap(), ResampleMethod::Mean);
        assert_eq!("ffill".parse::<ResampleMethod>().unwrap(), ResampleMethod::ForwardFill);
        assert_eq!(
            "rolling_mean:600".parse::<ResampleMethod>().unwrap(),
            ResampleMethod::RollingMean { window_secs: 600 }
        );
        assert_eq!(
            "rolling".parse::<ResampleMethod>().unwrap(),
            ResampleMethod::RollingMean { window_secs: 3000 }
        );
        assert!("average".parse::<ResampleMethod>().is_err());
        assert!("rolling:0".parse::<ResampleMethod>().is_err());
        let round = ResampleMethod::RollingMean { window_secs: 60 };
        assert_eq!(round.to_string().parse::<ResampleMethod>().unwrap(), round);
    }

    #[test]
    fn text_tags_fall_back_to_nearest() {
        assert_eq!(ResampleMethod::Mean.effective(DataType::String), ResampleMethod::Nearest);
        assert_eq!(ResampleMethod::Max.effective(DataType::Bool), ResampleMethod::Nearest);
        assert_eq!(
            ResampleMethod::ForwardFill.effective(DataType::String),
            ResampleMethod::ForwardFill
        );
        assert_eq!(ResampleMethod::Raw.effective(DataType::Bool), ResampleMethod::Raw);
        assert_eq!(ResampleMethod::Median.effective(DataType::Int), ResampleMethod::Median);
    }

    #[test]
    fn auto_bucket_has_a_one_second_floor() {
        assert_eq!(auto_bucket_ns(0, 60 * S), S);
        assert_eq!(auto_bucket_ns(0, 5000 * S), 10 * S);
        assert_eq!(auto_bucket_ns(10, 0), S);
    }

    #[test]
    fn mean_of_repeating_quarters_is_two_and_a_half() {
        let out = resample(&quarter_pattern(3), ResampleMethod::Mean, 0, 60 * S).unwrap();
        assert_eq!(values(&out), vec![(0, 2.5), (60, 2.5), (120, 2.5)]);
    }

    #[test]
    fn single_minute_mean_holds_the_last_sample_to_the_bucket_end() -> anyhow::Result<()> {
        let out = resample(&quarter_pattern(1), ResampleMethod::Mean, 0, 60 * S)?;
        assert_eq!(values(&out), vec![(0, 2.5)]);
        Ok(())
    }

    #[test]
    fn mean_weights_samples_by_how_long_they_hold() -> anyhow::Result<()> {
        // 0 holds for 50s, 10 for the last 10s
        let points = vec![f(0, 0.0), f(50, 10.0)];
        let out = resample(&points, ResampleMethod::Mean, 0, 60 * S)?;
        assert_eq!(values(&out), vec![(0, 10.0 / 6.0)]);

        // a sample spanning a bucket edge is split between both buckets
        let points = vec![f(0, 2.0), f(90, 4.0)];
        let out = resample(&points, ResampleMethod::Mean, 0, 60 * S)?;
        assert_eq!(values(&out), vec![(0, 2.0), (60, 3.0)]);
        Ok(())
    }

    #[test]
    fn mean_over_a_long_range_is_linear_in_samples() -> anyhow::Result<()> {
        // a year of 10-minute samples in daily buckets
        let points: Vec<Point> = (0..365 * 144).map(|i| f(i * 600, (i % 2) as f64)).collect();
        let out = resample(&points, ResampleMethod::Mean, 0, 86_400 * S)?;
        assert_eq!(out.len(), 365);
        assert!(out.iter().all(|p| p.value == Value::Float(0.5)));
        Ok(())
    }

    #[test]
    fn sub_fine_buckets_use_plain_mean() {
        let points = vec![
            Point::new(0, Value::Float(1.0)),
            Point::new(10_000_000, Value::Float(3.0)),
        ];
        let out = resample(&points, ResampleMethod::Mean, 0, 50_000_000).unwrap();
        assert_eq!(out, vec![Point::new(0, Value::Float(2.0))]);
    }

    #[test]
    fn aggregates_per_bucket() {
        let points = vec![f(0, 5.0), f(3, 1.0), f(7, 9.0), f(21, 4.0), f(22, 6.0)];
        let min = resample(&points, ResampleMethod::Min, 0, 10 * S).unwrap();
        assert_eq!(values(&min), vec![(0, 1.0), (20, 4.0)]);
        let max = resample(&points, ResampleMethod::Max, 0, 10 * S).unwrap();
        assert_eq!(values(&max), vec![(0, 9.0), (20, 6.0)]);
        let median = resample(&points, ResampleMethod::Median, 0, 10 * S).unwrap();
        assert_eq!(values(&median), vec![(0, 5.0), (20, 5.0)]);
    }

    #[test]
    fn nearest_and_ffill_keep_the_value_type() {
        let points = vec![
            Point::new(2 * S, Value::Text("a".into())),
            Point::new(14 * S, Value::Text("b".into())),
        ];
        let nearest = resample(&points, ResampleMethod::Nearest, 0, 5 * S).unwrap();
        let labels: Vec<_> = nearest.iter().map(|p| (p.ts_ns / S, p.value.to_string())).collect();
        assert_eq!(
            labels,
            vec![(0, "a".into()), (5, "a".into()), (10, "b".into())]
        );
        let ffill = resample(&points, ResampleMethod::ForwardFill, 0, 5 * S).unwrap();
        let labels: Vec<_> = ffill.iter().map(|p| (p.ts_ns / S, p.value.to_string())).collect();
        assert_eq!(labels, vec![(5, "a".into()), (10, "a".into())]);
    }

    #[test]
    fn nearest_ties_pick_the_earlier_sample() {
        let points = vec![f(0, 1.0), f(10, 2.0)];
        assert_eq!(nearest(&points, 5 * S).map(|p| p.ts_ns), Some(0));
        assert_eq!(nearest(&points, 6 * S).map(|p| p.ts_ns), Some(10 * S));
    }

    #[test]
    fn interpolates_between_samples() {
        let points = vec![f(1, 0.0), f(11, 10.0)];
        let out = resample(&points, ResampleMethod::LinearInterpolate, 0, 5 * S).unwrap();
        assert_eq!(values(&out), vec![(0, 0.0), (5, 4.0), (10, 9.0)]);
    }

    #[test]
    fn rolling_mean_looks_back_over_the_window() {
        let points = vec![f(0, 1.0), f(10, 3.0), f(20, 5.0)];
        let method = ResampleMethod::RollingMean { window_secs: 15 };
        let out = resample(&points, method, 0, 10 * S).unwrap();
        assert_eq!(values(&out), vec![(0, 1.0), (10, 2.0), (20, 4.0)]);
    }

    #[test]
    fn raw_and_empty_input() {
        let points = vec![f(1, 1.0), f(2, 2.0)];
        assert_eq!(resample(&points, ResampleMethod::Raw, 0, S).unwrap(), points);
        assert!(resample(&[], ResampleMethod::Mean, 0, S).unwrap().is_empty());
        assert!(resample(&points, ResampleMethod::Mean, 0, 0).is_err());
    }
}
