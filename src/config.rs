//! Collector configuration.
//!
//! A JSON document describing where data lives, how the archive is
//! partitioned and which devices to poll. Relative paths are resolved
//! against the directory of the configuration file.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result, Timezone};
use crate::protocol::registers::Endianness;
use crate::protocol::{DeviceKind, ModbusConfig, ModbusDevice, SimulatedDevice, Waveform};
use crate::store::layout::validate_component;
use crate::supervisor::{BackoffSchedule, Supervisor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Root of the day-partitioned archive.
    /// Default: "store"
    #[serde(default = "default_store_root")]
    pub store_root: PathBuf,

    /// Root of the one-minute coarse cache.
    /// Default: "coarse"
    #[serde(default = "default_coarse_root")]
    pub coarse_root: PathBuf,

    /// SQLite database holding staged samples.
    /// Default: "staging.sqlite"
    #[serde(default = "default_staging_path")]
    pub staging_path: PathBuf,

    /// Tag sheet the catalog is built from.
    #[serde(default)]
    pub catalog_csv: Option<PathBuf>,

    /// Built catalog artifact.
    /// Default: "catalog.json"
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Timezone of the day partitions: "UTC" or a fixed offset such as
    /// "+01:00". Daylight saving is not applied.
    /// Default: "UTC"
    #[serde(default)]
    pub timezone: Timezone,

    /// Seconds between archiver runs.
    /// Default: 3600
    #[serde(default = "default_archive_interval_secs")]
    pub archive_interval_secs: u64,

    /// Queries ending within this many seconds of now also read staging.
    /// Default: 172800 (two days)
    #[serde(default = "default_staging_window_secs")]
    pub staging_window_secs: u64,

    /// Query worker threads. Default: available parallelism.
    #[serde(default)]
    pub query_workers: Option<usize>,

    /// Reconnection tiers shared by every device.
    #[serde(default)]
    pub backoff: BackoffSchedule,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Must match the `device` column of the catalog.
    pub name: String,
    #[serde(flatten)]
    pub settings: DeviceSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceSettings {
    Modbus {
        host: String,
        #[serde(default = "default_modbus_port")]
        port: u16,
        #[serde(default)]
        endianness: Endianness,
        /// Default: 5000
        #[serde(default = "default_connect_timeout_ms")]
        connect_timeout_ms: u64,
        /// Default: 3000
        #[serde(default = "default_io_timeout_ms")]
        io_timeout_ms: u64,
    },
    Simulated {
        #[serde(default)]
        waveforms: BTreeMap<String, Waveform>,
        #[serde(default)]
        default_waveform: Option<Waveform>,
    },
}

fn default_store_root() -> PathBuf {
    PathBuf::from("store")
}

fn default_coarse_root() -> PathBuf {
    PathBuf::from("coarse")
}

fn default_staging_path() -> PathBuf {
    PathBuf::from("staging.sqlite")
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("catalog.json")
}

fn default_archive_interval_secs() -> u64 {
    3600
}

fn default_staging_window_secs() -> u64 {
    2 * 86_400
}

fn default_modbus_port() -> u16 {
    502
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_io_timeout_ms() -> u64 {
    3000
}

impl CollectorConfig {
    /// Read, validate and resolve paths against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: CollectorConfig = serde_json::from_str(&text)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.store_root);
        resolve(&mut self.coarse_root);
        resolve(&mut self.staging_path);
        resolve(&mut self.catalog_path);
        if let Some(csv) = self.catalog_csv.as_mut() {
            resolve(csv);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive_interval_secs == 0 {
            return Err(Error::Config("archive_interval_secs must be positive".to_string()));
        }
        if self.query_workers == Some(0) {
            return Err(Error::Config("query_workers must be positive".to_string()));
        }
        let mut names = BTreeSet::new();
        for device in &self.devices {
            validate_component("device", &device.name)?;
            if !names.insert(device.name.as_str()) {
                return Err(Error::Config(format!("device {} configured twice", device.name)));
            }
            if let DeviceSettings::Modbus {
                host,
                io_timeout_ms,
                ..
            } = &device.settings
            {
                if host.trim().is_empty() {
                    return Err(Error::Config(format!("device {} has no host", device.name)));
                }
                if *io_timeout_ms == 0 {
                    return Err(Error::Config(format!(
                        "device {} needs a positive io timeout",
                        device.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn archive_interval(&self) -> Duration {
        Duration::from_secs(self.archive_interval_secs)
    }

    pub fn staging_window(&self) -> Duration {
        Duration::from_secs(self.staging_window_secs)
    }

    /// One supervisor per configured device.
    pub fn supervisors(&self) -> Vec<Supervisor> {
        self.devices
            .iter()
            .map(|device| Supervisor::new(&device.name, device.build(), self.backoff.clone()))
            .collect()
    }
}

impl DeviceConfig {
    pub fn build(&self) -> DeviceKind {
        match &self.settings {
            DeviceSettings::Modbus {
                host,
                port,
                endianness,
                connect_timeout_ms,
                io_timeout_ms,
            } => DeviceKind::Modbus(ModbusDevice::new(
                ModbusConfig::tcp(format!("{host}:{port}"))
                    .with_endianness(*endianness)
                    .with_connect_timeout(Duration::from_millis(*connect_timeout_ms))
                    .with_io_timeout(Duration::from_millis(*io_timeout_ms)),
            )),
            DeviceSettings::Simulated {
                waveforms,
                default_waveform,
            } => {
                let mut device = SimulatedDevice::new();
                if let Some(waveform) = default_waveform {
                    device = device.with_default_waveform(*waveform);
                }
                for (tag, waveform) in waveforms {
                    device = device.with_waveform(tag.clone(), *waveform);
                }
                DeviceKind::Simulated(device)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::registers::WordOrder;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"{
        "timezone": "+01:00",
        "catalog_csv": "tags.csv",
        "archive_interval_secs": 600,
        "devices": [
            {"name": "plc", "kind": "modbus", "host": "10.0.0.5",
             "endianness": {"word_order": "little"}},
            {"name": "sim", "kind": "simulated",
             "waveforms": {"T1": {"shape": "sine", "period_secs": 60.0, "amplitude": 2.0}}}
        ]
    }"#;

    #[test]
    fn loads_with_defaults_and_resolved_paths() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("collector.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = CollectorConfig::load(&path).unwrap();
        assert_eq!(config.timezone, Timezone::FixedOffset(3600));
        assert_eq!(config.archive_interval(), Duration::from_secs(600));
        assert_eq!(config.staging_window_secs, 172_800);
        assert_eq!(config.store_root, dir.path().join("store"));
        assert_eq!(config.catalog_csv, Some(dir.path().join("tags.csv")));
        assert_eq!(config.backoff, BackoffSchedule::default());

        match &config.devices[0].settings {
            DeviceSettings::Modbus {
                port, endianness, ..
            } => {
                assert_eq!(*port, 502);
                assert_eq!(endianness.word_order, WordOrder::Little);
            }
            other => panic!("unexpected {other:?}"),
        }
        let supervisors = config.supervisors();
        assert_eq!(supervisors.len(), 2);
        assert_eq!(supervisors[1].name(), "sim");
    }

    #[test]
    fn rejects_duplicate_devices_and_bad_values() {
        let dup = r#"{"devices": [
            {"name": "a", "kind": "simulated"},
            {"name": "a", "kind": "simulated"}
        ]}"#;
        let config: CollectorConfig = serde_json::from_str(dup).unwrap();
        assert!(config.validate().is_err());

        let zero: CollectorConfig =
            serde_json::from_str(r#"{"archive_interval_secs": 0}"#).unwrap();
        assert!(zero.validate().is_err());

        let bad_tz = serde_json::from_str::<CollectorConfig>(r#"{"timezone": "Mars/Base"}"#);
        assert!(bad_tz.is_err());
        let named = serde_json::from_str::<CollectorConfig>(r#"{"timezone": "Europe/Paris"}"#);
        assert!(named.is_err());
    }
}
