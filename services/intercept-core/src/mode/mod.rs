//! Mode definition table
//!
//! Every operating mode is bound to exactly one device class and one output
//! parser. The command line is built from the mode's template in
//! [`commands`] after the operator's parameters pass [`params`] validation.

mod commands;
mod params;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::device::DeviceClass;
use crate::parser::ParserKind;

pub use commands::build_command;
pub use params::{Gain, GainInput, ModeParams, NumberInput, ParamError, RemoteSdr, ValidatedParams};

/// Selectable operating function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Pager,
    Sensor,
    Adsb,
    ListeningPost,
    WifiScan,
    BluetoothScan,
}

impl ModeKind {
    pub const ALL: [ModeKind; 6] = [
        ModeKind::Pager,
        ModeKind::Sensor,
        ModeKind::Adsb,
        ModeKind::ListeningPost,
        ModeKind::WifiScan,
        ModeKind::BluetoothScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKind::Pager => "pager",
            ModeKind::Sensor => "sensor",
            ModeKind::Adsb => "adsb",
            ModeKind::ListeningPost => "listening_post",
            ModeKind::WifiScan => "wifi_scan",
            ModeKind::BluetoothScan => "bluetooth_scan",
        }
    }

    pub fn definition(&self) -> &'static ModeDefinition {
        // MODE_TABLE is ordered like ModeKind::ALL
        &MODE_TABLE[*self as usize]
    }

    pub fn device_class(&self) -> DeviceClass {
        self.definition().device_class
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMode(pub String);

impl fmt::Display for UnknownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown mode: {}", self.0)
    }
}

impl std::error::Error for UnknownMode {}

impl FromStr for ModeKind {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ModeKind::ALL
            .into_iter()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

/// Lifecycle state of one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeState {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for ModeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModeState::Idle => "idle",
            ModeState::Starting => "starting",
            ModeState::Running => "running",
            ModeState::Stopping => "stopping",
            ModeState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Static description of one mode
#[derive(Debug)]
pub struct ModeDefinition {
    pub kind: ModeKind,
    pub device_class: DeviceClass,
    pub parser: ParserKind,
    pub description: &'static str,
}

pub static MODE_TABLE: [ModeDefinition; 6] = [
    ModeDefinition {
        kind: ModeKind::Pager,
        device_class: DeviceClass::Sdr,
        parser: ParserKind::Pager,
        description: "POCSAG/FLEX pager decoding (rtl_fm | multimon-ng)",
    },
    ModeDefinition {
        kind: ModeKind::Sensor,
        device_class: DeviceClass::Sdr,
        parser: ParserKind::Sensor,
        description: "433MHz ISM sensor decoding (rtl_433)",
    },
    ModeDefinition {
        kind: ModeKind::Adsb,
        device_class: DeviceClass::Sdr,
        parser: ParserKind::Aircraft,
        description: "ADS-B aircraft tracking (dump1090)",
    },
    ModeDefinition {
        kind: ModeKind::ListeningPost,
        device_class: DeviceClass::Sdr,
        parser: ParserKind::Spectrum,
        description: "Frequency range power scan (rtl_power)",
    },
    ModeDefinition {
        kind: ModeKind::WifiScan,
        device_class: DeviceClass::Wifi,
        parser: ParserKind::Wifi,
        description: "Monitor-mode beacon capture (tshark)",
    },
    ModeDefinition {
        kind: ModeKind::BluetoothScan,
        device_class: DeviceClass::Bluetooth,
        parser: ParserKind::Bluetooth,
        description: "Bluetooth device discovery (bluetoothctl)",
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_order_matches_kinds() {
        for kind in ModeKind::ALL {
            assert_eq!(kind.definition().kind, kind);
        }
    }

    #[test]
    fn test_device_classes() {
        assert_eq!(ModeKind::Pager.device_class(), DeviceClass::Sdr);
        assert_eq!(ModeKind::ListeningPost.device_class(), DeviceClass::Sdr);
        assert_eq!(ModeKind::WifiScan.device_class(), DeviceClass::Wifi);
        assert_eq!(ModeKind::BluetoothScan.device_class(), DeviceClass::Bluetooth);
    }

    #[test]
    fn test_parse_mode_names() {
        assert_eq!("adsb".parse::<ModeKind>().unwrap(), ModeKind::Adsb);
        assert_eq!("listening-post".parse::<ModeKind>().unwrap(), ModeKind::ListeningPost);
        assert_eq!("WIFI_SCAN".parse::<ModeKind>().unwrap(), ModeKind::WifiScan);
        assert!("satellite".parse::<ModeKind>().is_err());
    }
}
