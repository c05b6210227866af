//! Typed events produced by the stream parsers and the mode controller

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::mode::{ModeKind, ModeState};

/// One decoded observation or control notification, as delivered to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub mode: ModeKind,

    /// Emission order within one run of `mode`, starting at 1
    pub seq: u64,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(mode: ModeKind, seq: u64, payload: EventPayload) -> Self {
        Self {
            mode,
            seq,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }
}

/// Mode-specific payloads, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    PagerMessage(PagerMessage),
    SensorReading(SensorReading),
    Aircraft(AircraftPosition),
    Spectrum(SpectrumSegment),
    WifiNetwork(WifiNetwork),
    BluetoothDevice(BluetoothDevice),
    ModeState(ModeStateChange),
    InterfaceRenamed(InterfaceRenamed),
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::PagerMessage(_) => "pager_message",
            EventPayload::SensorReading(_) => "sensor_reading",
            EventPayload::Aircraft(_) => "aircraft",
            EventPayload::Spectrum(_) => "spectrum",
            EventPayload::WifiNetwork(_) => "wifi_network",
            EventPayload::BluetoothDevice(_) => "bluetooth_device",
            EventPayload::ModeState(_) => "mode_state",
            EventPayload::InterfaceRenamed(_) => "interface_renamed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PagerContent {
    Alpha,
    Numeric,
    Tone,
}

/// Decoded POCSAG or FLEX page
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PagerMessage {
    /// e.g. "POCSAG1200", "FLEX"
    pub protocol: String,
    pub capcode: u32,
    /// POCSAG function bits (0-3); FLEX has none
    pub function: Option<u8>,
    pub content: PagerContent,
    pub text: String,
}

/// One 433MHz sensor transmission, measured fields in canonical units
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub model: String,
    pub id: Option<String>,
    pub channel: Option<String>,
    /// temperature_C, humidity, pressure_hPa, wind_avg_m_s, rain_mm, battery_ok, ...
    pub fields: BTreeMap<String, f64>,
}

/// Aircraft identification and state vector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AircraftPosition {
    /// 24-bit ICAO address, six uppercase hex digits
    pub icao: String,
    pub callsign: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Feet
    pub altitude_ft: Option<i32>,
    /// Knots
    pub speed_kts: Option<f64>,
    pub heading_deg: Option<f64>,
    pub squawk: Option<String>,
}

/// One rtl_power sweep row reduced to its peak bin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpectrumSegment {
    pub freq_low_hz: u64,
    pub freq_high_hz: u64,
    pub step_hz: f64,
    pub peak_freq_hz: u64,
    pub peak_db: f64,
    pub mean_db: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiNetwork {
    pub bssid: String,
    pub ssid: Option<String>,
    pub channel: Option<u16>,
    pub signal_dbm: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BluetoothDevice {
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i32>,
}

/// Controller transition, with the human-readable cause for errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModeStateChange {
    pub state: ModeState,
    pub cause: Option<String>,
}

/// Monitor-mode acquisition renamed the WiFi interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceRenamed {
    pub from: String,
    pub to: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format_is_flat_and_tagged() {
        let event = Event::new(
            ModeKind::WifiScan,
            7,
            EventPayload::WifiNetwork(WifiNetwork {
                bssid: "AA:BB:CC:DD:EE:FF".to_string(),
                ssid: Some("cafe".to_string()),
                channel: Some(6),
                signal_dbm: Some(-52),
            }),
        );

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "wifi_network");
        assert_eq!(value["mode"], "wifi_scan");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["bssid"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(value["channel"], 6);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_type_name_matches_serde_tag() {
        let payload = EventPayload::InterfaceRenamed(InterfaceRenamed {
            from: "wlan0".into(),
            to: "wlan0mon".into(),
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["type"], payload.type_name());
    }
}
