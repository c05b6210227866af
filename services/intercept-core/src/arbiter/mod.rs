//! Resource arbiter
//!
//! Owns the holder of every device class. A class is held by at most one mode
//! at a time; `acquire` never waits for a holder to go away. Each class has its
//! own mutex, held only for the bookkeeping and never across the monitor-mode
//! procedure, so a concurrent acquire sees `Busy` while WiFi is being switched.

mod monitor;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::device::{Device, DeviceClass, DeviceRegistry};
use crate::mode::ModeKind;

pub use monitor::{AirmonNg, MonitorControl, MonitorError};

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("{class} device is held by {holder}")]
    Busy { class: DeviceClass, holder: ModeKind },

    #[error("no {0} device available")]
    NoDevice(DeviceClass),

    #[error("{mode} does not hold the {class} device")]
    NotHolder { class: DeviceClass, mode: ModeKind },

    #[error("monitor mode: {0}")]
    Monitor(#[from] MonitorError),
}

/// What a mode was granted by a successful acquire
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub class: DeviceClass,
    pub device_id: String,
    pub index: Option<u32>,
    /// WiFi only: the interface to capture on after monitor-mode resolution
    pub interface: Option<String>,
    /// WiFi only: the managed-mode name, when monitor mode renamed it
    pub renamed_from: Option<String>,
}

/// Consistent view of one device class
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub class: DeviceClass,
    pub device: Option<Device>,
    pub holder: Option<ModeKind>,
    pub interface: Option<String>,
}

#[derive(Debug, Default)]
struct Slot {
    device: Option<Device>,
    holder: Option<ModeKind>,
    grant: Option<Grant>,
}

pub struct ResourceArbiter {
    /// Indexed by `DeviceClass as usize`
    slots: [Mutex<Slot>; 3],
    monitor: Arc<dyn MonitorControl>,
}

impl ResourceArbiter {
    pub fn new(registry: &DeviceRegistry, monitor: Arc<dyn MonitorControl>) -> Self {
        let slots = DeviceClass::ALL.map(|class| {
            Mutex::new(Slot {
                device: registry.primary(class).cloned(),
                ..Default::default()
            })
        });
        Self { slots, monitor }
    }

    fn slot(&self, class: DeviceClass) -> MutexGuard<'_, Slot> {
        // nothing panics while a slot is locked, so a poisoned one is still consistent
        self.slots[class as usize]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `class` for `mode`. Fails immediately if another mode holds it.
    pub async fn acquire(&self, class: DeviceClass, mode: ModeKind) -> Result<Grant, ArbiterError> {
        let device = {
            let mut slot = self.slot(class);
            if let Some(holder) = slot.holder {
                return Err(ArbiterError::Busy { class, holder });
            }
            let device = match &slot.device {
                Some(d) if d.present => d.clone(),
                _ => return Err(ArbiterError::NoDevice(class)),
            };
            slot.holder = Some(mode);
            device
        };

        let mut grant = Grant {
            class,
            device_id: device.id.clone(),
            index: device.index,
            interface: None,
            renamed_from: None,
        };

        if class == DeviceClass::Wifi {
            match self.enter_monitor(&device).await {
                Ok(resolved) => {
                    if resolved != device.id {
                        grant.renamed_from = Some(device.id.clone());
                    }
                    grant.interface = Some(resolved);
                }
                Err(e) => {
                    self.slot(class).holder = None;
                    return Err(e.into());
                }
            }
        }

        self.slot(class).grant = Some(grant.clone());
        info!("{} acquired {} device {}", mode, class, grant.device_id);
        Ok(grant)
    }

    async fn enter_monitor(&self, device: &Device) -> Result<String, MonitorError> {
        if !device.capabilities.monitor_mode {
            return Err(MonitorError::Unsupported(device.id.clone()));
        }
        self.monitor.enable(&device.id).await
    }

    /// Give `class` back. Only the holder may release; WiFi leaves monitor
    /// mode first and the class stays held until that finishes.
    pub async fn release(&self, class: DeviceClass, mode: ModeKind) -> Result<(), ArbiterError> {
        let grant = {
            let slot = self.slot(class);
            if slot.holder != Some(mode) {
                return Err(ArbiterError::NotHolder { class, mode });
            }
            slot.grant.clone()
        };

        if let Some(iface) = grant.as_ref().and_then(|g| g.interface.as_deref()) {
            if let Err(e) = self.monitor.disable(iface).await {
                warn!("Failed to leave monitor mode on {}: {}", iface, e);
            }
        }

        let mut slot = self.slot(class);
        slot.holder = None;
        slot.grant = None;
        // a device that vanished while held is forgotten once released
        if slot.device.as_ref().is_some_and(|d| !d.present) {
            slot.device = None;
        }
        info!("{} released {} device", mode, class);
        Ok(())
    }

    /// Release every held class regardless of holder
    pub async fn release_all(&self) {
        for class in DeviceClass::ALL {
            let holder = self.slot(class).holder;
            if let Some(mode) = holder {
                if let Err(e) = self.release(class, mode).await {
                    warn!("Release of {} during kill-all failed: {}", class, e);
                }
            }
        }
    }

    pub fn holder(&self, class: DeviceClass) -> Option<ModeKind> {
        self.slot(class).holder
    }

    pub fn snapshot(&self) -> Vec<DeviceStatus> {
        DeviceClass::ALL
            .iter()
            .map(|class| {
                let slot = self.slot(*class);
                DeviceStatus {
                    class: *class,
                    device: slot.device.clone(),
                    holder: slot.holder,
                    interface: slot.grant.as_ref().and_then(|g| g.interface.clone()),
                }
            })
            .collect()
    }

    /// Apply a rescan. Unheld devices follow the registry; a held device that
    /// disappeared is kept but flagged absent until its holder releases it.
    pub fn refresh(&self, registry: &DeviceRegistry) {
        for class in DeviceClass::ALL {
            let mut slot = self.slot(class);
            let found = registry.primary(class).cloned();

            if slot.holder.is_none() {
                slot.device = found;
                continue;
            }

            let interface = slot.grant.as_ref().and_then(|g| g.interface.clone());
            if let Some(device) = slot.device.as_mut() {
                let still_there = registry
                    .devices()
                    .iter()
                    .any(|d| d.class == class && (d.id == device.id || Some(&d.id) == interface.as_ref()));
                if device.present && !still_there {
                    warn!("Held {} device {} disappeared", class, device.id);
                } else if !device.present && still_there {
                    info!("Held {} device {} is back", class, device.id);
                }
                device.present = still_there;
            }
        }
    }
}
