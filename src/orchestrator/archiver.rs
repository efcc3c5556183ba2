//! Moves staged samples into the day store.
//!
//! Tags are archived one after the other. A tag's staged rows are deleted
//! only after every day they touch has been parked, so a failing tag keeps
//! its rows for the next cycle and never blocks the others.

use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{Tag, TagCatalog};
use crate::core::{Clock, Error, Result, SystemClock};
use crate::scheduler::{FirstRun, PeriodicTask};
use crate::staging::StagingStore;
use crate::store::{DayStore, Point};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub tags_archived: usize,
    pub rows_moved: usize,
    pub rows_rejected: usize,
    pub failed_tags: Vec<String>,
}

pub struct Archiver {
    catalog: Arc<TagCatalog>,
    staging: Arc<dyn StagingStore>,
    store: DayStore,
    clock: Arc<dyn Clock>,
}

impl Archiver {
    pub fn new(catalog: Arc<TagCatalog>, staging: Arc<dyn StagingStore>, store: DayStore) -> Self {
        Self {
            catalog,
            staging,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &DayStore {
        &self.store
    }

    /// Archive every row staged strictly before `now_ns`.
    pub fn run_once(&self, now_ns: i64) -> ArchiveReport {
        let mut report = ArchiveReport::default();
        for tag in self.catalog.tags() {
            match self.archive_tag(tag, now_ns) {
                Ok((0, 0)) => {}
                Ok((moved, rejected)) => {
                    report.tags_archived += 1;
                    report.rows_moved += moved;
                    report.rows_rejected += rejected;
                }
                Err(err) => {
                    log::error!("{err}");
                    report.failed_tags.push(tag.name.clone());
                }
            }
        }
        log::info!(
            "archived {} row(s) of {} tag(s), {} rejected, {} tag(s) failed",
            report.rows_moved,
            report.tags_archived,
            report.rows_rejected,
            report.failed_tags.len()
        );
        report
    }

    /// Returns (moved, rejected) row counts.
    fn archive_tag(&self, tag: &Tag, now_ns: i64) -> Result<(usize, usize)> {
        let failed = |reason: String| Error::Archive {
            tag: tag.name.clone(),
            reason,
        };
        let rows = self
            .staging
            .select_before(&tag.name, now_ns)
            .map_err(|err| failed(format!("staging select: {err}")))?;
        if rows.is_empty() {
            return Ok((0, 0));
        }

        let keys: Vec<_> = rows.iter().map(|row| row.key).collect();
        let mut points = Vec::with_capacity(rows.len());
        let mut rejected = 0;
        for row in rows {
            match row.value.coerce(tag.datatype) {
                Some(value) => points.push(Point::new(row.timestamp_ns, value)),
                None => {
                    rejected += 1;
                    log::warn!(
                        "{}: dropping staged value {:?}, not a {}",
                        tag.name,
                        row.value,
                        tag.datatype
                    );
                }
            }
        }

        let moved = points.len();
        self.store
            .park_points(&tag.name, tag.datatype, points)
            .map_err(|err| failed(format!("park: {err}")))?;
        self.staging
            .delete(&keys)
            .map_err(|err| failed(format!("staging delete: {err}")))?;
        log::debug!("{}: archived {moved} row(s)", tag.name);
        Ok((moved, rejected))
    }

    /// Run [`Archiver::run_once`] every `interval`, first on the next
    /// wall-clock boundary of the store timezone.
    pub fn start(self: Arc<Self>, interval: Duration) -> Result<PeriodicTask> {
        let timezone = self.store.timezone();
        PeriodicTask::start("archiver", interval, FirstRun::Aligned(timezone), move || {
            let report = self.run_once(self.clock.now_ns());
            if !report.failed_tags.is_empty() {
                log::warn!("archiver: failed tags {:?}", report.failed_tags);
            }
        })
    }
}
