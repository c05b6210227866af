//! Hardware enumeration from sysfs
//!
//! - SDR: USB devices with a Realtek RTL2832U vendor/product pair
//! - WiFi: network interfaces with a `wireless` or `phy80211` entry
//! - Bluetooth: `hciN` controllers under `class/bluetooth`
//!
//! Unreadable directories simply yield no devices; a host without a given
//! adapter is a normal configuration.

use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::registry::{Device, DeviceClass, DeviceRegistry};
use crate::config::DiscoveryConfig;

/// RTL2832U-based dongles (vendor, product)
const RTL_SDR_IDS: &[(&str, &str)] = &[("0bda", "2838"), ("0bda", "2832")];

/// Enumerate all capture devices visible under the configured sysfs root
pub fn discover(config: &DiscoveryConfig) -> DeviceRegistry {
    let root = config.sysfs_root.as_path();
    let mut devices = Vec::new();

    devices.extend(discover_sdr(root));
    devices.extend(pin_first(
        discover_wifi(root),
        config.wifi_interface.as_deref(),
        DeviceClass::Wifi,
    ));
    devices.extend(pin_first(
        discover_bluetooth(root),
        config.bluetooth_adapter.as_deref(),
        DeviceClass::Bluetooth,
    ));

    for class in DeviceClass::ALL {
        let found: Vec<&str> = devices
            .iter()
            .filter(|d| d.class == class)
            .map(|d| d.id.as_str())
            .collect();
        debug!("Discovered {} {}: {:?}", found.len(), class, found);
    }

    DeviceRegistry::new(devices)
}

/// Move the pinned device to the front; if it was not enumerated, trust the config
fn pin_first(mut found: Vec<Device>, pinned: Option<&str>, class: DeviceClass) -> Vec<Device> {
    let Some(name) = pinned else {
        return found;
    };

    match found.iter().position(|d| d.id == name) {
        Some(pos) => {
            let device = found.remove(pos);
            found.insert(0, device);
        }
        None => {
            info!("Configured {} device {} not enumerated, using it as-is", class, name);
            let mut device = Device::new(class, name);
            if class == DeviceClass::Wifi {
                device.capabilities.monitor_mode = true;
            }
            found.insert(0, device);
        }
    }
    found
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn sorted_entries(dir: &Path) -> Vec<(String, std::path::PathBuf)> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|e| (e.file_name().to_string_lossy().into_owned(), e.path()))
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn discover_sdr(root: &Path) -> Vec<Device> {
    let mut devices = Vec::new();

    for (name, path) in sorted_entries(&root.join("bus/usb/devices")) {
        let (Some(vendor), Some(product)) = (
            read_trimmed(&path.join("idVendor")),
            read_trimmed(&path.join("idProduct")),
        ) else {
            continue;
        };

        let known = RTL_SDR_IDS
            .iter()
            .any(|(v, p)| v.eq_ignore_ascii_case(&vendor) && p.eq_ignore_ascii_case(&product));
        if !known {
            continue;
        }

        let index = devices.len() as u32;
        let mut device = Device::new(DeviceClass::Sdr, name).with_index(index);
        let label = match (read_trimmed(&path.join("product")), read_trimmed(&path.join("serial"))) {
            (Some(p), Some(sn)) => Some(format!("{} SN:{}", p, sn)),
            (Some(p), None) => Some(p),
            (None, Some(sn)) => Some(format!("SN:{}", sn)),
            (None, None) => None,
        };
        device.label = label;
        devices.push(device);
    }

    devices
}

fn discover_wifi(root: &Path) -> Vec<Device> {
    sorted_entries(&root.join("class/net"))
        .into_iter()
        .filter_map(|(name, path)| {
            let has_phy = path.join("phy80211").exists();
            if !has_phy && !path.join("wireless").exists() {
                return None;
            }
            Some(Device::new(DeviceClass::Wifi, name).with_monitor_mode(has_phy))
        })
        .collect()
}

fn discover_bluetooth(root: &Path) -> Vec<Device> {
    sorted_entries(&root.join("class/bluetooth"))
        .into_iter()
        // hci0:12 style entries are connections, not controllers
        .filter(|(name, _)| name.starts_with("hci") && !name.contains(':'))
        .map(|(name, path)| {
            let device = Device::new(DeviceClass::Bluetooth, name);
            match read_trimmed(&path.join("address")) {
                Some(addr) => device.with_label(addr),
                None => device,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write(root: &Path, rel: &str, contents: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn fake_sysfs() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        write(root, "bus/usb/devices/1-1/idVendor", "0bda\n");
        write(root, "bus/usb/devices/1-1/idProduct", "2838\n");
        write(root, "bus/usb/devices/1-1/product", "RTL2838UHIDIR\n");
        write(root, "bus/usb/devices/1-1/serial", "00000001\n");
        write(root, "bus/usb/devices/1-2/idVendor", "046d\n");
        write(root, "bus/usb/devices/1-2/idProduct", "c52b\n");

        fs::create_dir_all(root.join("class/net/wlan0/phy80211")).unwrap();
        fs::create_dir_all(root.join("class/net/eth0")).unwrap();
        fs::create_dir_all(root.join("class/net/wlan1/wireless")).unwrap();

        write(root, "class/bluetooth/hci0/address", "00:1A:7D:DA:71:13\n");
        fs::create_dir_all(root.join("class/bluetooth/hci0:12")).unwrap();

        dir
    }

    fn config_for(root: PathBuf) -> DiscoveryConfig {
        DiscoveryConfig {
            sysfs_root: root,
            ..DiscoveryConfig::default()
        }
    }

    #[test]
    fn test_discover_all_classes() {
        let dir = fake_sysfs();
        let registry = discover(&config_for(dir.path().to_path_buf()));

        let sdr = registry.primary(DeviceClass::Sdr).unwrap();
        assert_eq!(sdr.id, "1-1");
        assert_eq!(sdr.index, Some(0));
        assert_eq!(sdr.label.as_deref(), Some("RTL2838UHIDIR SN:00000001"));
        assert_eq!(registry.count(DeviceClass::Sdr), 1);

        let wifi = registry.primary(DeviceClass::Wifi).unwrap();
        assert_eq!(wifi.id, "wlan0");
        assert!(wifi.capabilities.monitor_mode);
        assert_eq!(registry.count(DeviceClass::Wifi), 2);

        let bt = registry.primary(DeviceClass::Bluetooth).unwrap();
        assert_eq!(bt.id, "hci0");
        assert_eq!(registry.count(DeviceClass::Bluetooth), 1);
    }

    #[test]
    fn test_pinned_wifi_interface_goes_first() {
        let dir = fake_sysfs();
        let mut config = config_for(dir.path().to_path_buf());
        config.wifi_interface = Some("wlan1".to_string());

        let registry = discover(&config);
        let wifi = registry.primary(DeviceClass::Wifi).unwrap();
        assert_eq!(wifi.id, "wlan1");
        assert!(!wifi.capabilities.monitor_mode);
    }

    #[test]
    fn test_missing_sysfs_yields_empty_registry() {
        let registry = discover(&config_for(PathBuf::from("/nonexistent/sysfs")));
        assert!(registry.devices().is_empty());
    }
}
