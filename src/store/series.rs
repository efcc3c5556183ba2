use crate::core::{DataType, Value};

/// One archived sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub ts_ns: i64,
    pub value: Value,
}

impl Point {
    pub fn new(ts_ns: i64, value: Value) -> Self {
        Self { ts_ns, value }
    }
}

/// Stable sort by timestamp, then keep the first point of every timestamp.
pub fn normalize(points: &mut Vec<Point>) {
    points.sort_by_key(|point| point.ts_ns);
    points.dedup_by_key(|point| point.ts_ns);
}

/// Keep points with `t0_ns <= ts <= t1_ns`. Input must be sorted.
pub fn clip(points: Vec<Point>, t0_ns: i64, t1_ns: i64) -> Vec<Point> {
    let start = points.partition_point(|point| point.ts_ns < t0_ns);
    let end = points.partition_point(|point| point.ts_ns <= t1_ns);
    if start >= end {
        return Vec::new();
    }
    let mut points = points;
    points.truncate(end);
    points.drain(..start);
    points
}

/// Coerce every value to `datatype`, dropping what cannot be represented.
/// Returns the number of dropped points.
pub fn coerce_all(points: &mut Vec<Point>, datatype: DataType) -> usize {
    let before = points.len();
    points.retain_mut(|point| match point.value.coerce(datatype) {
        Some(value) => {
            point.value = value;
            true
        }
        None => false,
    });
    before - points.len()
}
