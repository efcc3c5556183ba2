//! Connection supervision for one device.
//!
//! A [`Supervisor`] owns the device, tracks its [`ConnectionState`] and runs a
//! watcher thread that reconnects with tiered backoff. The watcher is a plain
//! loop: sleep for the current interval, check the link, try once, update the
//! backoff.

mod backoff;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::catalog::Tag;
use crate::core::{lock, Result, StopSignal, Timezone};
use crate::protocol::{CollectResult, Device, DeviceKind};

pub use backoff::{Backoff, BackoffSchedule, BackoffTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            2 => ConnectionState::Connected,
            1 => ConnectionState::Connecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

struct Shared {
    name: String,
    device: Mutex<DeviceKind>,
    state: AtomicU8,
    backoff: Mutex<Backoff>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn connect(&self) -> bool {
        self.set_state(ConnectionState::Connecting);
        let ok = lock(&self.device).connect();
        self.set_state(if ok {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        });
        ok
    }
}

struct Watcher {
    stop: Arc<StopSignal>,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    watcher: Mutex<Option<Watcher>>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, device: DeviceKind, schedule: BackoffSchedule) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                device: Mutex::new(device),
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                backoff: Mutex::new(Backoff::new(schedule)),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// One connection attempt. Success resets the backoff.
    pub fn connect(&self) -> bool {
        let ok = self.shared.connect();
        if ok {
            lock(&self.shared.backoff).reset();
            log::info!("{}: connected", self.shared.name);
        } else {
            log::warn!("{}: connection attempt failed", self.shared.name);
        }
        ok
    }

    pub fn mark_disconnected(&self) {
        if self.state() != ConnectionState::Disconnected {
            log::warn!("{}: marked disconnected", self.shared.name);
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Poll the device. Concurrent callers are serialized on the device.
    pub fn collect(&self, timezone: Timezone, tags: &[Tag]) -> CollectResult {
        lock(&self.shared.device).collect(timezone, tags)
    }

    /// (tier, trial) of the reconnection schedule.
    pub fn backoff_position(&self) -> (usize, u32) {
        let backoff = lock(&self.shared.backoff);
        (backoff.tier(), backoff.trial())
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.watcher)
            .as_ref()
            .map(|watcher| !watcher.handle.is_finished())
            .unwrap_or(false)
    }

    /// Start the reconnection watcher, replacing a running one.
    pub fn start_watch(&self) -> Result<()> {
        self.stop_watch();
        let stop = Arc::new(StopSignal::new());
        let shared = Arc::clone(&self.shared);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("watch-{}", self.shared.name))
            .spawn(move || watch_loop(&shared, &thread_stop))?;
        *lock(&self.watcher) = Some(Watcher { stop, handle });
        Ok(())
    }

    /// Start the watcher unless one is already alive.
    pub fn ensure_watching(&self) -> Result<()> {
        if self.is_watching() {
            return Ok(());
        }
        self.start_watch()
    }

    /// Signal the watcher and wait for it to exit.
    pub fn stop_watch(&self) {
        let watcher = lock(&self.watcher).take();
        if let Some(watcher) = watcher {
            watcher.stop.stop();
            if watcher.handle.join().is_err() {
                log::error!("{}: watcher thread panicked", self.shared.name);
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_watch();
    }
}

fn watch_loop(shared: &Shared, stop: &StopSignal) {
    loop {
        let wait = lock(&shared.backoff).interval();
        if stop.wait_timeout(wait) {
            break;
        }
        if shared.state() == ConnectionState::Connected {
            continue;
        }
        if shared.connect() {
            lock(&shared.backoff).reset();
            log::info!("{}: connection established again", shared.name);
        } else {
            let mut backoff = lock(&shared.backoff);
            backoff.record_failure();
            log::warn!(
                "{}: still unreachable, next attempt in {}s (tier {}, trial {})",
                shared.name,
                backoff.interval().as_secs(),
                backoff.tier(),
                backoff.trial()
            );
        }
    }
    log::debug!("{}: watcher stopped", shared.name);
}
