use std::time::{Duration, Instant};

/// Minimum spacing between two logs of the same failure streak.
pub const FAILURE_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Failure counters of one job.
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    consecutive: u64,
    absolute: u64,
    last_log: Option<Instant>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a failure. Returns whether it should be logged: the first of a
    /// streak always is, later ones once per [`FAILURE_LOG_INTERVAL`].
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive += 1;
        self.absolute += 1;
        let due = match self.last_log {
            _ if self.consecutive == 1 => true,
            None => true,
            Some(last) => now.saturating_duration_since(last) >= FAILURE_LOG_INTERVAL,
        };
        if due {
            self.last_log = Some(now);
        }
        due
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }

    pub fn absolute(&self) -> u64 {
        self.absolute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttles_repeated_failures() {
        let start = Instant::now();
        let mut tracker = FailureTracker::new();
        assert!(tracker.record_failure(start));
        assert!(!tracker.record_failure(start + Duration::from_secs(5)));
        assert!(!tracker.record_failure(start + Duration::from_secs(59)));
        assert!(tracker.record_failure(start + Duration::from_secs(60)));
        assert_eq!(tracker.consecutive(), 4);

        tracker.record_success();
        assert_eq!(tracker.consecutive(), 0);
        // a new streak logs at once
        assert!(tracker.record_failure(start + Duration::from_secs(61)));
        assert_eq!(tracker.absolute(), 5);
    }
}
