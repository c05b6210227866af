//! WiFi/Bluetooth device correlation
//!
//! Networks and Bluetooth devices seen on the event stream are kept as
//! observations. Pairs that showed up close together, share a vendor or
//! look alike in signal strength are reported as probably being the same
//! physical device.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::broadcast::{Received, Subscriber};
use crate::config::CorrelationConfig;
use crate::event::{Event, EventPayload};
use crate::parser::round_to;

/// Oldest entries beyond this are evicted per radio
const MAX_OBSERVATIONS: usize = 4096;

/// Longest accepted timing window
const MAX_WINDOW_SECS: u64 = 7 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    /// Upper-case, colon separated
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i32>,
    pub manufacturer: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Observation {
    fn oui(&self) -> &str {
        self.address.get(..8).unwrap_or(&self.address)
    }
}

#[derive(Debug, Default)]
struct Observations {
    wifi: HashMap<String, Observation>,
    bluetooth: HashMap<String, Observation>,
}

/// What has been seen so far, fed from the event stream
#[derive(Debug, Default)]
pub struct ObservationLog {
    inner: Mutex<Observations>,
    /// Upper-case OUI to vendor name
    vendors: HashMap<String, String>,
}

impl ObservationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observations get a manufacturer when their OUI is in `vendors`
    pub fn with_vendors(vendors: &HashMap<String, String>) -> Self {
        Self {
            inner: Mutex::default(),
            vendors: vendors
                .iter()
                .map(|(oui, name)| (oui.trim().to_ascii_uppercase(), name.clone()))
                .collect(),
        }
    }

    fn vendor(&self, address: &str) -> Option<String> {
        let oui = address.get(..8)?.to_ascii_uppercase();
        self.vendors.get(&oui).cloned()
    }

    /// Fold one event in; anything other than a sighting is ignored
    pub fn record(&self, event: &Event) {
        let (address, name, rssi, bluetooth) = match &event.payload {
            EventPayload::WifiNetwork(n) => (&n.bssid, n.ssid.clone(), n.signal_dbm, false),
            EventPayload::BluetoothDevice(d) => (&d.address, d.name.clone(), d.rssi, true),
            _ => return,
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seen = if bluetooth {
            &mut inner.bluetooth
        } else {
            &mut inner.wifi
        };

        match seen.get_mut(address) {
            Some(obs) => {
                obs.last_seen = obs.last_seen.max(event.timestamp);
                if name.is_some() {
                    obs.name = name;
                }
                if rssi.is_some() {
                    obs.rssi = rssi;
                }
            }
            None => {
                if seen.len() >= MAX_OBSERVATIONS {
                    evict_stalest(seen);
                }
                seen.insert(
                    address.clone(),
                    Observation {
                        address: address.clone(),
                        name,
                        rssi,
                        manufacturer: self.vendor(address),
                        first_seen: event.timestamp,
                        last_seen: event.timestamp,
                    },
                );
            }
        }
    }

    pub fn wifi(&self) -> Vec<Observation> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.wifi.values().cloned().collect()
    }

    pub fn bluetooth(&self) -> Vec<Observation> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bluetooth.values().cloned().collect()
    }

    /// Lookup by address, in any letter case
    pub fn find_wifi(&self, address: &str) -> Option<Observation> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.wifi.get(&address.trim().to_ascii_uppercase()).cloned()
    }

    pub fn find_bluetooth(&self, address: &str) -> Option<Observation> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.bluetooth.get(&address.trim().to_ascii_uppercase()).cloned()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.wifi.clear();
        inner.bluetooth.clear();
    }

    /// Record everything `sub` delivers until the broadcaster goes away
    pub async fn follow(&self, mut sub: Subscriber) {
        while let Some(received) = sub.recv().await {
            match received {
                Received::Event(event) => self.record(&event),
                Received::Overrun(n) => debug!("Correlation feed missed {} events", n),
            }
        }
    }
}

fn evict_stalest(seen: &mut HashMap<String, Observation>) {
    let stalest = seen
        .values()
        .min_by_key(|o| o.last_seen)
        .map(|o| o.address.clone());
    if let Some(address) = stalest {
        seen.remove(&address);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correlation {
    pub wifi_address: String,
    pub wifi_name: Option<String>,
    pub bt_address: String,
    pub bt_name: Option<String>,
    /// 0.0 to 1.0, two decimals
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct Correlator {
    window: Duration,
    min_confidence: f64,
    rssi_threshold: i32,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(&CorrelationConfig::default())
    }
}

impl Correlator {
    pub fn new(config: &CorrelationConfig) -> Self {
        if config.window_secs > MAX_WINDOW_SECS {
            warn!(
                "Correlation window of {}s clamped to {}s",
                config.window_secs, MAX_WINDOW_SECS
            );
        }
        Self {
            window: Duration::seconds(config.window_secs.min(MAX_WINDOW_SECS) as i64),
            min_confidence: config.min_confidence,
            rssi_threshold: config.rssi_threshold_db as i32,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Every pair at or above the minimum confidence, best first
    pub fn correlate(&self, wifi: &[Observation], bluetooth: &[Observation]) -> Vec<Correlation> {
        let mut found: Vec<Correlation> = wifi
            .iter()
            .flat_map(|w| bluetooth.iter().map(move |b| (w, b)))
            .filter_map(|(w, b)| {
                let confidence = self.score(w, b);
                (confidence >= self.min_confidence).then(|| self.describe(w, b, confidence))
            })
            .collect();

        found.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.wifi_address.cmp(&b.wifi_address))
                .then_with(|| a.bt_address.cmp(&b.bt_address))
        });
        found
    }

    pub fn correlate_log(&self, log: &ObservationLog) -> Vec<Correlation> {
        self.correlate(&log.wifi(), &log.bluetooth())
    }

    /// Score one pair regardless of the minimum confidence
    pub fn analyze(&self, wifi: &Observation, bt: &Observation) -> Correlation {
        self.describe(wifi, bt, self.score(wifi, bt))
    }

    fn describe(&self, wifi: &Observation, bt: &Observation, confidence: f64) -> Correlation {
        Correlation {
            wifi_address: wifi.address.clone(),
            wifi_name: wifi.name.clone(),
            bt_address: bt.address.clone(),
            bt_name: bt.name.clone(),
            confidence: round_to(confidence, 2),
            reason: self.reason(wifi, bt),
        }
    }

    fn first_seen_gap(&self, wifi: &Observation, bt: &Observation) -> Option<f64> {
        let delta = wifi.first_seen - bt.first_seen;
        let gap = if delta < Duration::zero() { -delta } else { delta };
        (gap <= self.window).then(|| gap.num_milliseconds() as f64 / 1000.0)
    }

    fn rssi_gap(&self, wifi: &Observation, bt: &Observation) -> Option<i32> {
        let gap = (wifi.rssi? - bt.rssi?).abs();
        (gap <= self.rssi_threshold).then_some(gap)
    }

    fn score(&self, wifi: &Observation, bt: &Observation) -> f64 {
        let window = self.window.num_milliseconds() as f64 / 1000.0;
        let mut score = match self.first_seen_gap(wifi, bt) {
            Some(_) if window <= 0.0 => 0.5,
            Some(gap) => 0.5 * (1.0 - gap / window),
            // present at the same time, just not discovered together
            None if wifi.first_seen <= bt.last_seen && bt.first_seen <= wifi.last_seen => 0.25,
            None => 0.0,
        };

        score += match manufacturer_match(wifi, bt) {
            Some(VendorMatch::Same) => 0.2,
            Some(VendorMatch::Similar) => 0.1,
            None => 0.0,
        };

        if wifi.oui().eq_ignore_ascii_case(bt.oui()) {
            score += 0.15;
        }

        if let Some(gap) = self.rssi_gap(wifi, bt) {
            score += match self.rssi_threshold {
                0 => 0.1,
                t => 0.1 * (1.0 - gap as f64 / t as f64),
            };
        }

        if wifi.name.is_some() && bt.name.is_some() {
            score += 0.05;
        }

        score.min(1.0)
    }

    fn reason(&self, wifi: &Observation, bt: &Observation) -> String {
        let mut reasons = Vec::new();
        if let Some(gap) = self.first_seen_gap(wifi, bt) {
            reasons.push(format!("appeared within {}s", gap as u64));
        }
        if wifi.oui().eq_ignore_ascii_case(bt.oui()) {
            reasons.push("same OUI".to_string());
        }
        if let (Some(VendorMatch::Same), Some(vendor)) = (manufacturer_match(wifi, bt), &wifi.manufacturer) {
            reasons.push(format!("same manufacturer ({})", vendor));
        }
        if self.rssi_gap(wifi, bt).is_some() {
            reasons.push("similar signal strength".to_string());
        }

        if reasons.is_empty() {
            "timing overlap".to_string()
        } else {
            reasons.join("; ")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VendorMatch {
    Same,
    /// Names share their first five characters
    Similar,
}

fn manufacturer_match(wifi: &Observation, bt: &Observation) -> Option<VendorMatch> {
    let wifi = wifi.manufacturer.as_deref()?.to_lowercase();
    let bt = bt.manufacturer.as_deref()?.to_lowercase();
    if wifi == bt {
        Some(VendorMatch::Same)
    } else if wifi.chars().take(5).eq(bt.chars().take(5)) {
        Some(VendorMatch::Similar)
    } else {
        None
    }
}
