//! Configuration for the orchestration core
//!
//! Everything here has a working default so an empty config file (or none)
//! yields a usable setup on a stock Linux host with the decoders on `PATH`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// How to launch one external tool.
///
/// Deserializes from either a bare program name (`"rtl_433"`) or an argv
/// prefix list (`["sudo", "airmon-ng"]`). Mode-specific arguments are appended
/// after the prefix as discrete argv entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            leading_args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl<'de> Deserialize<'de> for ToolCommand {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Program(String),
            Argv(Vec<String>),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Program(program) => Ok(ToolCommand::new(program)),
            Raw::Argv(mut argv) => {
                if argv.is_empty() {
                    return Err(serde::de::Error::custom("tool command must not be empty"));
                }
                let program = argv.remove(0);
                Ok(ToolCommand {
                    program,
                    leading_args: argv,
                })
            }
        }
    }
}

/// Launchers for every external program the modes drive
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub rtl_fm: ToolCommand,
    pub multimon_ng: ToolCommand,
    pub rtl_433: ToolCommand,
    pub dump1090: ToolCommand,
    pub rtl_power: ToolCommand,
    pub tshark: ToolCommand,
    pub bluetoothctl: ToolCommand,
    pub airmon_ng: ToolCommand,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rtl_fm: ToolCommand::new("rtl_fm"),
            multimon_ng: ToolCommand::new("multimon-ng"),
            rtl_433: ToolCommand::new("rtl_433"),
            dump1090: ToolCommand::new("dump1090"),
            rtl_power: ToolCommand::new("rtl_power"),
            tshark: ToolCommand::new("tshark"),
            bluetoothctl: ToolCommand::new("bluetoothctl"),
            airmon_ng: ToolCommand::new("airmon-ng"),
        }
    }
}

/// Process supervision timings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time between the interrupt signal and the forced kill
    pub grace_period_ms: u64,

    /// A pipeline that exits inside this window counts as a launch failure
    pub startup_check_ms: u64,

    /// After one pipeline stage exits on its own, how long the others get to drain
    pub crash_drain_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 3000,
            startup_check_ms: 500,
            crash_drain_ms: 1000,
        }
    }
}

impl SupervisorConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn startup_check(&self) -> Duration {
        Duration::from_millis(self.startup_check_ms)
    }

    pub fn crash_drain(&self) -> Duration {
        Duration::from_millis(self.crash_drain_ms)
    }
}

/// Hardware discovery settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Root of the sysfs tree (overridable for tests and containers)
    pub sysfs_root: PathBuf,

    /// Pin the WiFi adapter instead of taking the first wireless interface
    pub wifi_interface: Option<String>,

    /// Pin the Bluetooth adapter instead of taking the first hciN
    pub bluetooth_adapter: Option<String>,

    /// Seconds between hot-plug rescans (0 disables)
    pub rescan_interval_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            wifi_interface: None,
            bluetooth_adapter: None,
            rescan_interval_secs: 10,
        }
    }
}

/// WiFi/Bluetooth pairing thresholds
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// First sightings further apart than this get no timing credit
    pub window_secs: u64,

    /// Pairs scoring below this are not reported
    pub min_confidence: f64,

    /// Largest RSSI difference that still counts as similar
    pub rssi_threshold_db: u32,

    /// Vendor names by OUI (`"AA:BB:CC"`), used for manufacturer matching
    pub vendors: HashMap<String, String>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            min_confidence: 0.5,
            rssi_threshold_db: 20,
            vendors: HashMap::new(),
        }
    }
}

/// Retention of per-device signal strength readings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_readings_per_device: usize,
    pub max_devices: usize,
    pub max_age_hours: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_readings_per_device: 1000,
            max_devices: 4096,
            max_age_hours: 24,
        }
    }
}

/// Core configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolPaths,
    pub supervisor: SupervisorConfig,
    pub discovery: DiscoveryConfig,
    pub correlation: CorrelationConfig,
    pub history: HistoryConfig,

    /// Per-subscriber queue depth of the event broadcaster
    pub event_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            supervisor: SupervisorConfig::default(),
            discovery: DiscoveryConfig::default(),
            correlation: CorrelationConfig::default(),
            history: HistoryConfig::default(),
            event_queue_capacity: 1000,
        }
    }
}
