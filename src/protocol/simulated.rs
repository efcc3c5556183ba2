//! In-process device producing deterministic waveforms.
//!
//! Used for demos and for exercising the collector without hardware. A
//! [`SimulationControl`] handle scripts outages while the device itself is
//! owned by its supervisor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::catalog::Tag;
use crate::core::{lock, Clock, DataType, SystemClock, Timezone, Value, NANOS_PER_SEC};
use crate::protocol::{CollectError, CollectResult, Device, Reading, Readings};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Waveform {
    /// Increases by `step` on every poll.
    Ramp { step: f64 },
    Sine { period_secs: f64, amplitude: f64 },
    Constant { value: f64 },
    /// Alternates between 0 and 1 on every poll.
    Toggle,
}

impl Default for Waveform {
    fn default() -> Self {
        Waveform::Ramp { step: 1.0 }
    }
}

impl Waveform {
    fn sample(&self, poll: u64, timestamp_ns: i64) -> f64 {
        match *self {
            Waveform::Ramp { step } => step * poll as f64,
            Waveform::Sine {
                period_secs,
                amplitude,
            } => {
                let secs = timestamp_ns as f64 / NANOS_PER_SEC as f64;
                amplitude * (std::f64::consts::TAU * secs / period_secs.max(f64::EPSILON)).sin()
            }
            Waveform::Constant { value } => value,
            Waveform::Toggle => (poll % 2) as f64,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    unreachable: bool,
    failing_connects: u32,
    failing_collects: u32,
    garbled_collects: u32,
    connect_attempts: u64,
    polls: u64,
}

/// Shared handle for scripting a [`SimulatedDevice`].
#[derive(Debug, Clone, Default)]
pub struct SimulationControl {
    script: Arc<Mutex<Script>>,
}

impl SimulationControl {
    fn with<T>(&self, f: impl FnOnce(&mut Script) -> T) -> T {
        f(&mut lock(&self.script))
    }

    /// While set, every connect fails and every collect reports a lost link.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.with(|s| s.unreachable = unreachable);
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.with(|s| s.failing_connects = count);
    }

    /// The next `count` collects report a lost link.
    pub fn drop_next_collects(&self, count: u32) {
        self.with(|s| s.failing_collects = count);
    }

    /// The next `count` collects answer with an undecodable payload.
    pub fn garble_next_collects(&self, count: u32) {
        self.with(|s| s.garbled_collects = count);
    }

    pub fn connect_attempts(&self) -> u64 {
        self.with(|s| s.connect_attempts)
    }

    pub fn polls(&self) -> u64 {
        self.with(|s| s.polls)
    }
}

pub struct SimulatedDevice {
    clock: Arc<dyn Clock>,
    waveforms: HashMap<String, Waveform>,
    default_waveform: Waveform,
    control: SimulationControl,
    connected: bool,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            waveforms: HashMap::new(),
            default_waveform: Waveform::default(),
            control: SimulationControl::default(),
            connected: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_waveform(mut self, tag: impl Into<String>, waveform: Waveform) -> Self {
        self.waveforms.insert(tag.into(), waveform);
        self
    }

    pub fn with_default_waveform(mut self, waveform: Waveform) -> Self {
        self.default_waveform = waveform;
        self
    }

    pub fn control(&self) -> SimulationControl {
        self.control.clone()
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for SimulatedDevice {
    fn protocol(&self) -> &'static str {
        "simulated"
    }

    fn connect(&mut self) -> bool {
        let ok = self.control.with(|s| {
            s.connect_attempts += 1;
            if s.unreachable {
                return false;
            }
            if s.failing_connects > 0 {
                s.failing_connects -= 1;
                return false;
            }
            true
        });
        self.connected = ok;
        ok
    }

    fn collect(&mut self, timezone: Timezone, tags: &[Tag]) -> CollectResult {
        enum Outcome {
            Lost,
            Garbled,
            Poll(u64),
        }

        if !self.connected {
            return Err(CollectError::Connection("simulated device not connected".to_string()));
        }

        let outcome = self.control.with(|s| {
            if s.unreachable {
                return Outcome::Lost;
            }
            if s.failing_collects > 0 {
                s.failing_collects -= 1;
                return Outcome::Lost;
            }
            if s.garbled_collects > 0 {
                s.garbled_collects -= 1;
                return Outcome::Garbled;
            }
            s.polls += 1;
            Outcome::Poll(s.polls)
        });
        let poll = match outcome {
            Outcome::Lost => {
                self.connected = false;
                return Err(CollectError::Connection("simulated link down".to_string()));
            }
            Outcome::Garbled => {
                return Err(CollectError::Decode("simulated garbled payload".to_string()));
            }
            Outcome::Poll(poll) => poll,
        };

        let timestamp_ns = self.clock.now_ns();
        let mut readings = Readings::new();
        for tag in tags {
            let waveform = self
                .waveforms
                .get(&tag.name)
                .copied()
                .unwrap_or(self.default_waveform);
            let raw = waveform.sample(poll, timestamp_ns);
            let value = match tag.datatype {
                DataType::String => Value::Text(format!("state-{}", raw.round() as i64)),
                DataType::Bool => Value::Bool(raw != 0.0),
                DataType::Int => Value::Int(raw.round() as i64),
                DataType::Float => Value::Float(raw),
            };
            readings.insert(
                tag.name.clone(),
                Reading {
                    value,
                    timestamp_ns,
                    timezone,
                },
            );
        }
        Ok(readings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TagAddress;
    use crate::core::ManualClock;

    fn tag(name: &str, datatype: DataType) -> Tag {
        Tag {
            name: name.to_string(),
            description: String::new(),
            unit: String::new(),
            datatype,
            frequency_secs: 1,
            device: "sim".to_string(),
            address: TagAddress::Symbol {
                symbol: name.to_string(),
            },
        }
    }

    #[test]
    fn produces_typed_readings_at_clock_time() {
        let clock = ManualClock::new(42 * NANOS_PER_SEC);
        let mut device = SimulatedDevice::new()
            .with_clock(Arc::new(clock.clone()))
            .with_waveform("flag", Waveform::Toggle);
        assert!(device.connect());

        let tags = [tag("ramp", DataType::Float), tag("flag", DataType::Bool)];
        let first = device.collect(Timezone::UTC, &tags).unwrap();
        assert_eq!(first["ramp"].value, Value::Float(1.0));
        assert_eq!(first["flag"].value, Value::Bool(true));
        assert_eq!(first["ramp"].timestamp_ns, 42 * NANOS_PER_SEC);

        let second = device.collect(Timezone::UTC, &tags).unwrap();
        assert_eq!(second["ramp"].value, Value::Float(2.0));
        assert_eq!(second["flag"].value, Value::Bool(false));
    }

    #[test]
    fn scripted_outages() {
        let mut device = SimulatedDevice::new();
        let control = device.control();
        control.fail_next_connects(1);
        assert!(!device.connect());
        assert!(device.connect());

        control.garble_next_collects(1);
        assert!(matches!(
            device.collect(Timezone::UTC, &[]),
            Err(CollectError::Decode(_))
        ));
        control.drop_next_collects(1);
        assert!(matches!(
            device.collect(Timezone::UTC, &[]),
            Err(CollectError::Connection(_))
        ));
        // The lost link stays lost until reconnected.
        assert!(matches!(
            device.collect(Timezone::UTC, &[]),
            Err(CollectError::Connection(_))
        ));
        assert!(device.connect());
        assert!(device.collect(Timezone::UTC, &[]).is_ok());
        assert_eq!(control.connect_attempts(), 3);
    }
}
