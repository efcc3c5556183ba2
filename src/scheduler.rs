//! Fixed-period task runner.
//!
//! Each [`PeriodicTask`] owns one named thread. Deadlines advance by whole
//! intervals from the first deadline, so a slow invocation never shifts the
//! grid: ticks that pass while the action is still running are skipped, never
//! queued, and invocations never overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::{clock, Error, Result, StopSignal, Timezone, NANOS_PER_SEC};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstRun {
    Immediate,
    /// Wait for the next wall-clock multiple of the interval in this timezone.
    Aligned(Timezone),
}

#[derive(Debug, Default)]
struct Counters {
    runs: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskStats {
    pub runs: u64,
    pub skipped_ticks: u64,
}

pub struct PeriodicTask {
    name: String,
    interval: Duration,
    stop: Arc<StopSignal>,
    counters: Arc<Counters>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn start<F>(
        name: impl Into<String>,
        interval: Duration,
        first_run: FirstRun,
        mut action: F,
    ) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(Error::Config("task interval must be positive".to_string()));
        }
        let name = name.into();
        let stop = Arc::new(StopSignal::new());
        let counters = Arc::new(Counters::default());

        let first_deadline = match first_run {
            FirstRun::Immediate => Duration::ZERO,
            FirstRun::Aligned(timezone) => until_aligned(clock::now_ns(), interval, timezone),
        };

        let thread_stop = Arc::clone(&stop);
        let thread_counters = Arc::clone(&counters);
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let origin = Instant::now();
            let mut deadline = first_deadline;
            loop {
                let wait = deadline.saturating_sub(origin.elapsed());
                if thread_stop.wait_timeout(wait) {
                    break;
                }
                action();
                thread_counters.runs.fetch_add(1, Ordering::Relaxed);

                let (next, skipped) = next_deadline(deadline, interval, origin.elapsed());
                if skipped > 0 {
                    thread_counters.skipped.fetch_add(skipped, Ordering::Relaxed);
                    log::debug!("{thread_name}: overran its interval, skipped {skipped} tick(s)");
                }
                deadline = next;
            }
        })?;

        log::debug!("{name}: started with interval {interval:?}");
        Ok(Self {
            name,
            interval,
            stop,
            counters,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            runs: self.counters.runs.load(Ordering::Relaxed),
            skipped_ticks: self.counters.skipped.load(Ordering::Relaxed),
        }
    }

    /// Signal the worker and wait for it. No invocation starts after this
    /// returns; one already running is allowed to finish.
    pub fn stop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("{}: task thread panicked", self.name);
            }
            log::debug!("{}: stopped", self.name);
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Advance `deadline` by one interval, then past every tick that already
/// elapsed. Returns the next deadline and the number of skipped ticks.
///
/// A tick landing exactly on `elapsed` is not skipped; it runs at once.
pub fn next_deadline(deadline: Duration, interval: Duration, elapsed: Duration) -> (Duration, u64) {
    let next = deadline + interval;
    if next >= elapsed {
        return (next, 0);
    }
    let behind = (elapsed - next).as_nanos();
    let step = interval.as_nanos();
    let skipped = behind.div_ceil(step);
    let skipped = u64::try_from(skipped).unwrap_or(u64::MAX);
    let advance = interval
        .checked_mul(u32::try_from(skipped).unwrap_or(u32::MAX))
        .unwrap_or(Duration::MAX);
    (next.saturating_add(advance), skipped)
}

/// Time until the next local wall-clock multiple of `interval`.
fn until_aligned(now_ns: i64, interval: Duration, timezone: Timezone) -> Duration {
    let step = i128::try_from(interval.as_nanos()).unwrap_or(i128::MAX);
    let local = now_ns as i128 + timezone.offset_seconds() as i128 * NANOS_PER_SEC as i128;
    let remainder = local.rem_euclid(step);
    if remainder == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(u64::try_from(step - remainder).unwrap_or(u64::MAX))
}
