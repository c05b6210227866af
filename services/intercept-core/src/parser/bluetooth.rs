//! `bluetoothctl` discovery output
//!
//! ```text
//! [NEW] Device 4C:87:5D:11:22:33 Galaxy Buds
//! [CHG] Device 4C:87:5D:11:22:33 RSSI: -67
//! [CHG] Device 4C:87:5D:11:22:33 RSSI: 0xffffffbd (-67)
//! [DEL] Device 4C:87:5D:11:22:33 Galaxy Buds
//! ```
//!
//! The interactive shell decorates lines with ANSI colour codes and a
//! `[bluetooth]#` prompt; both are stripped before matching. Names learnt from
//! `[NEW]` / `Name:` lines are remembered so RSSI updates carry them.

use std::collections::HashMap;

use super::{normalize_mac, ParseAnomaly, RecordDecoder};
use crate::event::{BluetoothDevice, EventPayload};

const MAX_TRACKED: usize = 4096;

#[derive(Debug, Default)]
pub struct BluetoothDecoder {
    known: HashMap<String, BluetoothDevice>,
}

impl BluetoothDecoder {
    fn entry(&mut self, address: &str) -> &mut BluetoothDevice {
        if self.known.len() >= MAX_TRACKED && !self.known.contains_key(address) {
            self.known.clear();
        }
        self.known
            .entry(address.to_string())
            .or_insert_with(|| BluetoothDevice {
                address: address.to_string(),
                name: None,
                rssi: None,
            })
    }
}

impl RecordDecoder for BluetoothDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<EventPayload>) -> Result<(), ParseAnomaly> {
        let line = strip_ansi(line);

        let (tag, rest) = if let Some(i) = line.find("[NEW] Device ") {
            ("NEW", &line[i + "[NEW] Device ".len()..])
        } else if let Some(i) = line.find("[CHG] Device ") {
            ("CHG", &line[i + "[CHG] Device ".len()..])
        } else if let Some(i) = line.find("[DEL] Device ") {
            ("DEL", &line[i + "[DEL] Device ".len()..])
        } else {
            return Ok(());
        };

        let rest = rest.trim();
        let (raw_addr, detail) = rest.split_once(' ').unwrap_or((rest, ""));
        let address = normalize_mac(raw_addr)
            .ok_or_else(|| ParseAnomaly::new(format!("bad device address {:?}", raw_addr)))?;
        let detail = detail.trim();

        match tag {
            "NEW" => {
                let name = device_name(detail, &address);
                let device = self.entry(&address);
                if name.is_some() {
                    device.name = name;
                }
                out.push(EventPayload::BluetoothDevice(device.clone()));
            }
            "CHG" => {
                if let Some(value) = detail.strip_prefix("RSSI:") {
                    let rssi = parse_rssi(value)?;
                    let device = self.entry(&address);
                    device.rssi = Some(rssi);
                    out.push(EventPayload::BluetoothDevice(device.clone()));
                } else if let Some(value) = detail
                    .strip_prefix("Name:")
                    .or_else(|| detail.strip_prefix("Alias:"))
                {
                    let name = device_name(value.trim(), &address);
                    let device = self.entry(&address);
                    if name.is_some() && device.name != name {
                        device.name = name;
                        out.push(EventPayload::BluetoothDevice(device.clone()));
                    }
                }
                // ManufacturerData, TxPower, ServicesResolved: not part of the record
            }
            _ => {
                self.known.remove(&address);
            }
        }
        Ok(())
    }
}

/// bluetoothctl shows unnamed devices under their address with dashes
fn device_name(detail: &str, address: &str) -> Option<String> {
    if detail.is_empty() {
        return None;
    }
    match normalize_mac(detail) {
        Some(as_mac) if as_mac == address => None,
        _ => Some(detail.to_string()),
    }
}

/// `-67`, `0xffffffbd (-67)` or bare `0xffffffbd`
fn parse_rssi(value: &str) -> Result<i32, ParseAnomaly> {
    let value = value.trim();
    let bad = || ParseAnomaly::new(format!("bad RSSI {:?}", value));

    if let (Some(open), Some(close)) = (value.find('('), value.rfind(')')) {
        if open < close {
            return value[open + 1..close].trim().parse::<i32>().map_err(|_| bad());
        }
    }
    if let Some(hex) = value.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).map(|v| v as i32).map_err(|_| bad());
    }
    value.parse::<i32>().map_err(|_| bad())
}

/// Remove CSI escape sequences and control characters
fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // parameters and intermediates, then one final byte in @..~
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            continue;
        }
        if c.is_control() && c != '\t' {
            continue;
        }
        out.push(c);
    }
    out
}
