//! Per-device signal strength history
//!
//! Readings are taken from WiFi, Bluetooth and 433MHz sensor events, keyed by
//! mode and device identifier (BSSID, Bluetooth address, sensor model/id).
//! Each device keeps a bounded window of its most recent readings.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::broadcast::{Received, Subscriber};
use crate::config::HistoryConfig;
use crate::event::{Event, EventPayload};
use crate::mode::ModeKind;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalReading {
    /// dBm for radios, the decoder's level for sensors
    pub signal: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// A year; longer lookbacks are treated as this
const MAX_QUERY_MINUTES: u64 = 365 * 24 * 60;

type DeviceKey = (ModeKind, String);

#[derive(Debug)]
pub struct SignalHistory {
    readings: Mutex<HashMap<DeviceKey, VecDeque<SignalReading>>>,
    per_device: usize,
    max_devices: usize,
    max_age: Duration,
}

impl Default for SignalHistory {
    fn default() -> Self {
        Self::new(&HistoryConfig::default())
    }
}

impl SignalHistory {
    pub fn new(config: &HistoryConfig) -> Self {
        Self {
            readings: Mutex::new(HashMap::new()),
            per_device: config.max_readings_per_device.max(1),
            max_devices: config.max_devices.max(1),
            max_age: Duration::hours(config.max_age_hours.min(24 * 365) as i64),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DeviceKey, VecDeque<SignalReading>>> {
        self.readings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the signal level out of a sighting; other events are ignored
    pub fn record(&self, event: &Event) {
        let (device_id, signal) = match &event.payload {
            EventPayload::WifiNetwork(n) => match n.signal_dbm {
                Some(dbm) => (n.bssid.clone(), dbm as f64),
                None => return,
            },
            EventPayload::BluetoothDevice(d) => match d.rssi {
                Some(rssi) => (d.address.clone(), rssi as f64),
                None => return,
            },
            EventPayload::SensorReading(r) => match r.fields.get("rssi") {
                Some(rssi) => {
                    let id = match &r.id {
                        Some(id) => format!("{}/{}", r.model, id),
                        None => r.model.clone(),
                    };
                    (id, *rssi)
                }
                None => return,
            },
            _ => return,
        };
        self.add(event.mode, &device_id, signal, None, event.timestamp);
    }

    pub fn add(
        &self,
        mode: ModeKind,
        device_id: &str,
        signal: f64,
        metadata: Option<serde_json::Value>,
        timestamp: DateTime<Utc>,
    ) {
        let mut readings = self.lock();
        let key = (mode, device_id.to_string());
        if !readings.contains_key(&key) && readings.len() >= self.max_devices {
            evict_quietest(&mut readings);
        }

        let window = readings.entry(key).or_default();
        window.push_back(SignalReading {
            signal,
            timestamp,
            metadata,
        });
        while window.len() > self.per_device {
            window.pop_front();
        }
    }

    /// `add`, stamped with the current time
    pub fn add_now(&self, mode: ModeKind, device_id: &str, signal: f64, metadata: Option<serde_json::Value>) {
        self.add(mode, device_id, signal, metadata, Utc::now());
    }

    /// Up to `limit` of the newest readings from the last `since_minutes`,
    /// oldest first
    pub fn query(&self, mode: ModeKind, device_id: &str, limit: usize, since_minutes: u64) -> Vec<SignalReading> {
        let cutoff = Utc::now() - Duration::minutes(since_minutes.min(MAX_QUERY_MINUTES) as i64);
        let readings = self.lock();
        let Some(window) = readings.get(&(mode, device_id.to_string())) else {
            return Vec::new();
        };

        let mut recent: Vec<SignalReading> = window
            .iter()
            .rev()
            .filter(|r| r.timestamp > cutoff)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }

    /// Drop readings older than the retention age; returns how many went
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.max_age;
        let mut readings = self.lock();
        let mut removed = 0;
        readings.retain(|_, window| {
            let before = window.len();
            window.retain(|r| r.timestamp >= cutoff);
            removed += before - window.len();
            !window.is_empty()
        });
        removed
    }

    pub fn prune_expired(&self) -> usize {
        self.prune(Utc::now())
    }

    pub fn device_count(&self) -> usize {
        self.lock().len()
    }

    /// Record everything `sub` delivers until the broadcaster goes away
    pub async fn follow(&self, mut sub: Subscriber) {
        while let Some(received) = sub.recv().await {
            match received {
                Received::Event(event) => self.record(&event),
                Received::Overrun(n) => debug!("Signal history missed {} events", n),
            }
        }
    }
}

/// Forget the device whose newest reading is the oldest
fn evict_quietest(readings: &mut HashMap<DeviceKey, VecDeque<SignalReading>>) {
    let quietest = readings
        .iter()
        .min_by_key(|(_, window)| window.back().map(|r| r.timestamp))
        .map(|(key, _)| key.clone());
    if let Some(key) = quietest {
        readings.remove(&key);
    }
}
