use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;

use tagvault::protocol::{DeviceKind, SimulatedDevice};
use tagvault::supervisor::{Backoff, BackoffSchedule, BackoffTier, ConnectionState, Supervisor};

#[test]
fn default_schedule_climbs_tiers_and_settles_hourly() {
    let mut backoff = Backoff::new(BackoffSchedule::default());
    let mut waits = Vec::new();
    for _ in 0..60 {
        waits.push(backoff.interval().as_secs());
        backoff.record_failure();
    }
    assert_eq!(waits[..9], [3, 3, 3, 5, 5, 5, 10, 10, 10]);
    assert!(waits.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(waits[59], 3600);
    assert_eq!(backoff.tier(), BackoffSchedule::default().tiers().len() - 1);

    backoff.reset();
    assert_eq!((backoff.tier(), backoff.trial()), (0, 0));
    assert_eq!(backoff.interval(), Duration::from_secs(3));
}

#[test]
fn schedules_must_increase() {
    assert!(BackoffSchedule::new(vec![]).is_err());
    assert!(BackoffSchedule::new(vec![BackoffTier::new(1, 5), BackoffTier::new(1, 5)]).is_err());
    assert!(BackoffSchedule::new(vec![BackoffTier::new(1, 0)]).is_err());
    let parsed: BackoffSchedule =
        serde_json::from_str(r#"[{"max_retries": 1, "interval_secs": 2}]"#).unwrap();
    assert_eq!(parsed.tiers(), &[BackoffTier::new(1, 2)]);
    assert!(serde_json::from_str::<BackoffSchedule>(r#"[]"#).is_err());
}

#[test]
fn watcher_reconnects_after_a_failed_attempt() -> Result<()> {
    let device = SimulatedDevice::new();
    let control = device.control();
    let supervisor = Supervisor::new(
        "sim",
        DeviceKind::Simulated(device),
        BackoffSchedule::new(vec![BackoffTier::new(100, 1)])?,
    );
    control.fail_next_connects(1);
    supervisor.start_watch()?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !supervisor.is_connected() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    supervisor.stop_watch();

    assert_eq!(supervisor.state(), ConnectionState::Connected);
    assert_eq!(control.connect_attempts(), 2);
    assert_eq!(supervisor.backoff_position(), (0, 0));
    Ok(())
}
