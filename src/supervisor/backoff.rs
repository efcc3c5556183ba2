use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// One tier of the reconnection schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffTier {
    pub max_retries: u32,
    pub interval_secs: u64,
}

impl BackoffTier {
    pub const fn new(max_retries: u32, interval_secs: u64) -> Self {
        Self {
            max_retries,
            interval_secs,
        }
    }
}

/// Ordered reconnection tiers with strictly increasing intervals. The last
/// tier is retried forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<BackoffTier>", into = "Vec<BackoffTier>")]
pub struct BackoffSchedule {
    tiers: Vec<BackoffTier>,
}

const DEFAULT_TIERS: [BackoffTier; 13] = [
    BackoffTier::new(2, 3),
    BackoffTier::new(2, 5),
    BackoffTier::new(2, 10),
    BackoffTier::new(2, 30),
    BackoffTier::new(2, 60),
    BackoffTier::new(2, 120),
    BackoffTier::new(2, 300),
    BackoffTier::new(2, 600),
    BackoffTier::new(2, 1200),
    BackoffTier::new(2, 1800),
    BackoffTier::new(2, 2400),
    BackoffTier::new(2, 3000),
    BackoffTier::new(100_000, 3600),
];

impl BackoffSchedule {
    pub fn new(tiers: Vec<BackoffTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::Config("backoff schedule has no tiers".to_string()));
        }
        if tiers.iter().any(|tier| tier.interval_secs == 0) {
            return Err(Error::Config("backoff interval must be positive".to_string()));
        }
        if tiers
            .windows(2)
            .any(|pair| pair[1].interval_secs <= pair[0].interval_secs)
        {
            return Err(Error::Config(
                "backoff intervals must be strictly increasing".to_string(),
            ));
        }
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[BackoffTier] {
        &self.tiers
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            tiers: DEFAULT_TIERS.to_vec(),
        }
    }
}

impl TryFrom<Vec<BackoffTier>> for BackoffSchedule {
    type Error = Error;

    fn try_from(value: Vec<BackoffTier>) -> Result<Self> {
        Self::new(value)
    }
}

impl From<BackoffSchedule> for Vec<BackoffTier> {
    fn from(value: BackoffSchedule) -> Self {
        value.tiers
    }
}

/// Position in a [`BackoffSchedule`].
#[derive(Debug, Clone)]
pub struct Backoff {
    schedule: BackoffSchedule,
    tier: usize,
    trial: u32,
}

impl Backoff {
    pub fn new(schedule: BackoffSchedule) -> Self {
        Self {
            schedule,
            tier: 0,
            trial: 0,
        }
    }

    /// Wait before the next reconnection attempt.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.schedule.tiers[self.tier].interval_secs)
    }

    pub fn record_failure(&mut self) {
        self.trial = self.trial.saturating_add(1);
        let last = self.schedule.tiers.len() - 1;
        if self.trial > self.schedule.tiers[self.tier].max_retries && self.tier < last {
            self.tier += 1;
            self.trial = 0;
        }
    }

    pub fn reset(&mut self) {
        self.tier = 0;
        self.trial = 0;
    }

    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn trial(&self) -> u32 {
        self.trial
    }
}
