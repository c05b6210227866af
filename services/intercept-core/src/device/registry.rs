//! Device registry types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of scarce hardware; each class is held by at most one mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Sdr,
    Wifi,
    Bluetooth,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 3] = [DeviceClass::Sdr, DeviceClass::Wifi, DeviceClass::Bluetooth];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Sdr => "sdr",
            DeviceClass::Wifi => "wifi",
            DeviceClass::Bluetooth => "bluetooth",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability flags reported by discovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub monitor_mode: bool,
}

/// One enumerated capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    pub class: DeviceClass,

    /// System identifier: USB path for SDRs, interface name for WiFi, hciN for Bluetooth
    pub id: String,

    /// Driver-level index (RTL-SDR device index)
    pub index: Option<u32>,

    /// Product string or serial, when the system exposes one
    pub label: Option<String>,

    pub capabilities: Capabilities,

    /// Cleared when a rescan no longer finds a device that is still held
    pub present: bool,
}

impl Device {
    pub fn new(class: DeviceClass, id: impl Into<String>) -> Self {
        Self {
            class,
            id: id.into(),
            index: None,
            label: None,
            capabilities: Capabilities::default(),
            present: true,
        }
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_monitor_mode(mut self, supported: bool) -> Self {
        self.capabilities.monitor_mode = supported;
        self
    }
}

/// Snapshot of the hardware found at enumeration time
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// The device a mode of this class will be bound to (first enumerated)
    pub fn primary(&self, class: DeviceClass) -> Option<&Device> {
        self.devices.iter().find(|d| d.class == class)
    }

    pub fn count(&self, class: DeviceClass) -> usize {
        self.devices.iter().filter(|d| d.class == class).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_is_first_of_class() {
        let registry = DeviceRegistry::new(vec![
            Device::new(DeviceClass::Wifi, "wlan1"),
            Device::new(DeviceClass::Sdr, "1-1").with_index(0),
            Device::new(DeviceClass::Wifi, "wlan0"),
        ]);
        assert_eq!(registry.primary(DeviceClass::Wifi).unwrap().id, "wlan1");
        assert_eq!(registry.primary(DeviceClass::Sdr).unwrap().index, Some(0));
        assert!(registry.primary(DeviceClass::Bluetooth).is_none());
        assert_eq!(registry.count(DeviceClass::Wifi), 2);
    }

    #[test]
    fn test_device_class_serializes_snake_case() {
        let json = serde_json::to_string(&DeviceClass::Bluetooth).unwrap();
        assert_eq!(json, "\"bluetooth\"");
    }
}
