//! tshark beacon rows: `bssid <TAB> ssid <TAB> channel <TAB> signal_dbm`
//!
//! An access point beacons about ten times a second, so a row is only emitted
//! when the network is new, its SSID or channel changed, or its signal moved
//! by at least [`SIGNAL_DELTA_DB`] since the last emitted row.

use std::collections::HashMap;

use super::{normalize_mac, ParseAnomaly, RecordDecoder};
use crate::event::{EventPayload, WifiNetwork};

pub const SIGNAL_DELTA_DB: i32 = 3;

/// Bound on remembered networks; the table is reset past this
const MAX_TRACKED: usize = 4096;

#[derive(Debug, Default)]
pub struct WifiDecoder {
    last: HashMap<String, WifiNetwork>,
}

impl WifiDecoder {
    fn is_news(&self, network: &WifiNetwork) -> bool {
        let Some(prev) = self.last.get(&network.bssid) else {
            return true;
        };
        if prev.ssid != network.ssid || prev.channel != network.channel {
            return true;
        }
        match (prev.signal_dbm, network.signal_dbm) {
            (Some(a), Some(b)) => (a - b).abs() >= SIGNAL_DELTA_DB,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

impl RecordDecoder for WifiDecoder {
    fn feed_line(&mut self, line: &str, out: &mut Vec<EventPayload>) -> Result<(), ParseAnomaly> {
        if !line.contains('\t') {
            // "Capturing on 'wlan0mon'" and packet counters
            return Ok(());
        }

        let mut cols = line.split('\t');
        let bssid_raw = cols.next().unwrap_or("");
        let bssid = normalize_mac(bssid_raw)
            .ok_or_else(|| ParseAnomaly::new(format!("bad BSSID {:?}", bssid_raw)))?;
        let ssid = cols.next().and_then(clean_ssid);
        let channel = first_value(cols.next())
            .map(|c| {
                c.parse::<u16>()
                    .map_err(|_| ParseAnomaly::new(format!("bad channel {:?}", c)))
            })
            .transpose()?;
        let signal_dbm = first_value(cols.next())
            .map(|s| {
                s.parse::<i32>()
                    .map_err(|_| ParseAnomaly::new(format!("bad signal {:?}", s)))
            })
            .transpose()?;

        let network = WifiNetwork {
            bssid,
            ssid,
            channel,
            signal_dbm,
        };
        if !self.is_news(&network) {
            return Ok(());
        }

        if self.last.len() >= MAX_TRACKED && !self.last.contains_key(&network.bssid) {
            self.last.clear();
        }
        self.last.insert(network.bssid.clone(), network.clone());
        out.push(EventPayload::WifiNetwork(network));
        Ok(())
    }
}

/// tshark joins repeated fields with commas; the first occurrence wins
fn first_value(col: Option<&str>) -> Option<&str> {
    col.and_then(|c| c.split(',').next())
        .map(str::trim)
        .filter(|c| !c.is_empty())
}

/// Hidden networks beacon an empty or NUL-filled SSID
fn clean_ssid(raw: &str) -> Option<String> {
    let ssid = raw.trim_end_matches(['\r', '\n']);
    let hidden = ssid == "<MISSING>" || ssid.replace("\\000", "").trim_matches('\0').is_empty();
    if hidden {
        None
    } else {
        Some(ssid.to_string())
    }
}
