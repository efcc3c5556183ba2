//! Polling jobs and the archiver.
//!
//! The catalog defines one job per (device, frequency) pair. Each job runs on
//! its own [`PeriodicTask`]; the device it polls is shared through the
//! device's [`Supervisor`], so jobs of different frequencies on the same
//! device take turns on the link.

pub mod archiver;
pub mod failures;
pub mod job;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::catalog::TagCatalog;
use crate::core::{lock, Error, Result, Timezone};
use crate::scheduler::{FirstRun, PeriodicTask};
use crate::staging::StagingStore;
use crate::supervisor::Supervisor;

pub use archiver::{ArchiveReport, Archiver};
pub use failures::FailureTracker;
pub use job::{job_name, DeviceJob, PollOutcome};

/// (device, frequency in seconds)
pub type JobKey = (String, u64);

pub struct Orchestrator {
    catalog: Arc<TagCatalog>,
    supervisors: BTreeMap<String, Arc<Supervisor>>,
    staging: Arc<dyn StagingStore>,
    timezone: Timezone,
    jobs: Mutex<BTreeMap<JobKey, PeriodicTask>>,
    archiver: Mutex<Option<PeriodicTask>>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<TagCatalog>,
        supervisors: Vec<Supervisor>,
        staging: Arc<dyn StagingStore>,
        timezone: Timezone,
    ) -> Self {
        let supervisors: BTreeMap<_, _> = supervisors
            .into_iter()
            .map(|s| (s.name().to_string(), Arc::new(s)))
            .collect();
        for device in catalog.devices() {
            if !supervisors.contains_key(&device) {
                log::warn!("device {device} has tags but no configuration, its jobs are unavailable");
            }
        }
        Self {
            catalog,
            supervisors,
            staging,
            timezone,
            jobs: Mutex::new(BTreeMap::new()),
            archiver: Mutex::new(None),
        }
    }

    pub fn supervisor(&self, device: &str) -> Option<&Arc<Supervisor>> {
        self.supervisors.get(device)
    }

    /// Every job the catalog defines for a configured device.
    pub fn possible_jobs(&self) -> Vec<JobKey> {
        self.catalog
            .job_keys()
            .into_iter()
            .filter(|(device, _)| self.supervisors.contains_key(device))
            .collect()
    }

    pub fn running_jobs(&self) -> Vec<JobKey> {
        lock(&self.jobs).keys().cloned().collect()
    }

    /// Start (or restart) the job polling `device` every `frequency_secs`.
    pub fn start_job(&self, device: &str, frequency_secs: u64) -> Result<()> {
        let supervisor = self
            .supervisors
            .get(device)
            .ok_or_else(|| Error::Config(format!("unknown device {device}")))?;
        let tags = self.catalog.tags_for(device, frequency_secs);
        if tags.is_empty() {
            return Err(Error::Config(format!(
                "no tags polled every {frequency_secs}s on {device}"
            )));
        }

        self.stop_job(device, frequency_secs);
        if !supervisor.is_connected() {
            supervisor.connect();
        }
        supervisor.ensure_watching()?;

        let mut job = DeviceJob::new(
            Arc::clone(supervisor),
            frequency_secs,
            tags,
            Arc::clone(&self.staging),
            self.timezone,
        );
        let task = PeriodicTask::start(
            job.name().to_string(),
            Duration::from_secs(frequency_secs),
            FirstRun::Immediate,
            move || {
                job.poll();
            },
        )?;
        log::info!("{}: started", task.name());
        lock(&self.jobs).insert((device.to_string(), frequency_secs), task);
        Ok(())
    }

    /// Stop a job and wait for its thread. Returns whether it was running.
    pub fn stop_job(&self, device: &str, frequency_secs: u64) -> bool {
        let task = lock(&self.jobs).remove(&(device.to_string(), frequency_secs));
        match task {
            Some(mut task) => {
                task.stop();
                log::info!("{}: stopped", task.name());
                true
            }
            None => false,
        }
    }

    pub fn start_all(&self) -> Result<()> {
        for (device, frequency_secs) in self.possible_jobs() {
            self.start_job(&device, frequency_secs)?;
        }
        Ok(())
    }

    /// Attach the archiver; it is stopped with everything else.
    pub fn start_archiver(&self, archiver: Arc<Archiver>, interval: Duration) -> Result<()> {
        let task = archiver.start(interval)?;
        let previous = lock(&self.archiver).replace(task);
        if let Some(mut previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// Stop jobs, the archiver and every watcher.
    pub fn stop_all(&self) {
        let jobs = std::mem::take(&mut *lock(&self.jobs));
        for (_, mut task) in jobs {
            task.stop();
        }
        let archiver = lock(&self.archiver).take();
        if let Some(mut archiver) = archiver {
            archiver.stop();
        }
        for supervisor in self.supervisors.values() {
            supervisor.stop_watch();
        }
        log::info!("orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop_all();
    }
}
