use std::sync::Arc;
use std::time::Instant;

use crate::catalog::Tag;
use crate::core::Timezone;
use crate::orchestrator::failures::FailureTracker;
use crate::protocol::CollectError;
use crate::staging::{Sample, StagingStore};
use crate::supervisor::Supervisor;

/// What one poll did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// The device is not connected; nothing was read.
    Skipped,
    Stored(usize),
    /// The link dropped during the poll; the watcher takes over.
    Disconnected,
    Failed,
}

/// The action behind one (device, frequency) job.
pub struct DeviceJob {
    name: String,
    supervisor: Arc<Supervisor>,
    tags: Vec<Tag>,
    staging: Arc<dyn StagingStore>,
    timezone: Timezone,
    failures: FailureTracker,
}

impl DeviceJob {
    pub fn new(
        supervisor: Arc<Supervisor>,
        frequency_secs: u64,
        tags: Vec<Tag>,
        staging: Arc<dyn StagingStore>,
        timezone: Timezone,
    ) -> Self {
        Self {
            name: job_name(supervisor.name(), frequency_secs),
            supervisor,
            tags,
            staging,
            timezone,
            failures: FailureTracker::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn poll(&mut self) -> PollOutcome {
        if !self.supervisor.is_connected() {
            log::trace!("{}: device not connected, skipping poll", self.name);
            return PollOutcome::Skipped;
        }

        match self.supervisor.collect(self.timezone, &self.tags) {
            Ok(readings) => {
                let samples = Sample::from_readings(readings);
                match self.staging.insert(&samples) {
                    Ok(stored) => {
                        self.failures.record_success();
                        PollOutcome::Stored(stored)
                    }
                    Err(err) => {
                        if self.failures.record_failure(Instant::now()) {
                            log::error!(
                                "{}: staging insert of {} sample(s) failed ({} in a row, {} total): {err}",
                                self.name,
                                samples.len(),
                                self.failures.consecutive(),
                                self.failures.absolute()
                            );
                        }
                        PollOutcome::Failed
                    }
                }
            }
            Err(CollectError::Connection(detail)) => {
                log::warn!("{}: connection lost: {detail}", self.name);
                self.supervisor.mark_disconnected();
                if let Err(err) = self.supervisor.ensure_watching() {
                    log::error!("{}: cannot start reconnection watcher: {err}", self.name);
                }
                PollOutcome::Disconnected
            }
            Err(CollectError::Decode(detail)) => {
                if self.failures.record_failure(Instant::now()) {
                    log::warn!(
                        "{}: poll failed ({} in a row, {} total): {detail}",
                        self.name,
                        self.failures.consecutive(),
                        self.failures.absolute()
                    );
                }
                PollOutcome::Failed
            }
        }
    }
}

/// Thread and log name of a job.
pub fn job_name(device: &str, frequency_secs: u64) -> String {
    format!("{device}_{frequency_secs}s")
}
