//! Device contract and protocol clients.
//!
//! Every protocol implements [`Device`]. The collector holds devices as a
//! [`DeviceKind`], so dispatch is a match on the variant rather than a lookup
//! table keyed by protocol name.

pub mod modbus;
pub mod registers;
pub mod simulated;

use std::collections::BTreeMap;
use std::fmt;

use crate::catalog::Tag;
use crate::core::{Timezone, Value};

pub use modbus::{ModbusConfig, ModbusDevice};
pub use simulated::{SimulatedDevice, SimulationControl, Waveform};

/// One polled value with its acquisition time.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: Value,
    pub timestamp_ns: i64,
    pub timezone: Timezone,
}

/// Poll result keyed by tag name.
pub type Readings = BTreeMap<String, Reading>;

/// Failure of a whole `collect` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    /// The device is unreachable; the only failure that drives reconnection.
    Connection(String),
    /// The device answered with nothing usable.
    Decode(String),
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectError::Connection(detail) => write!(f, "connection error: {detail}"),
            CollectError::Decode(detail) => write!(f, "decode error: {detail}"),
        }
    }
}

impl std::error::Error for CollectError {}

pub type CollectResult = std::result::Result<Readings, CollectError>;

pub trait Device: Send {
    /// Short protocol label used in logs.
    fn protocol(&self) -> &'static str;

    /// Open (or reopen) the link. Returns whether the device is reachable.
    fn connect(&mut self) -> bool;

    /// Read the current value of every tag in `tags`.
    ///
    /// Tags that fail to decode are left out of the result; the call only
    /// fails as a whole when the link is down or nothing could be decoded.
    fn collect(&mut self, timezone: Timezone, tags: &[Tag]) -> CollectResult;
}

/// The device variants the collector knows how to build from configuration,
/// plus an escape hatch for externally implemented protocols.
pub enum DeviceKind {
    Modbus(ModbusDevice),
    Simulated(SimulatedDevice),
    External(Box<dyn Device>),
}

impl Device for DeviceKind {
    fn protocol(&self) -> &'static str {
        match self {
            DeviceKind::Modbus(device) => device.protocol(),
            DeviceKind::Simulated(device) => device.protocol(),
            DeviceKind::External(device) => device.protocol(),
        }
    }

    fn connect(&mut self) -> bool {
        match self {
            DeviceKind::Modbus(device) => device.connect(),
            DeviceKind::Simulated(device) => device.connect(),
            DeviceKind::External(device) => device.connect(),
        }
    }

    fn collect(&mut self, timezone: Timezone, tags: &[Tag]) -> CollectResult {
        match self {
            DeviceKind::Modbus(device) => device.collect(timezone, tags),
            DeviceKind::Simulated(device) => device.collect(timezone, tags),
            DeviceKind::External(device) => device.collect(timezone, tags),
        }
    }
}

impl fmt::Debug for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DeviceKind").field(&self.protocol()).finish()
    }
}
