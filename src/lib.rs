//! Industrial telemetry collector.
//!
//! Devices are polled on fixed-period jobs, samples land in a staging store,
//! and an archiver moves them into day-partitioned compressed files that the
//! query engine resamples on read.

pub mod catalog;
pub mod config;
pub mod core;
pub mod orchestrator;
pub mod protocol;
pub mod scheduler;
pub mod staging;
pub mod store;
pub mod supervisor;

pub use crate::catalog::{CatalogBuilder, CsvCatalogBuilder, Tag, TagAddress, TagCatalog};
pub use crate::config::CollectorConfig;
pub use crate::core::{DataType, Error, Result, Timezone, Value};
pub use crate::orchestrator::{ArchiveReport, Archiver, Orchestrator};
pub use crate::protocol::{CollectError, Device, DeviceKind};
pub use crate::scheduler::{FirstRun, PeriodicTask};
pub use crate::staging::{MemoryStaging, StagingStore};
pub use crate::store::{CoarseCache, DayStore, Frame, QueryEngine, ResampleMethod};
pub use crate::supervisor::{BackoffSchedule, ConnectionState, Supervisor};
