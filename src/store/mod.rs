//! Day-partitioned archive: one compressed file per tag per local day, plus
//! the query engine and coarse cache built on top of it.

pub mod coarse;
pub mod day_file;
pub mod day_store;
pub mod layout;
pub mod maintenance;
pub mod query;
pub mod resample;
pub mod series;

pub use coarse::{CoarseCache, CoarseReport, CoarseStat, COARSE_RESOLUTION_NS};
pub use day_store::DayStore;
pub use layout::DayLayout;
pub use maintenance::{DaySummary, RepairReport};
pub use query::{Frame, QueryEngine, DEFAULT_STAGING_WINDOW};
pub use resample::{auto_bucket_ns, ResampleMethod};
pub use series::Point;
