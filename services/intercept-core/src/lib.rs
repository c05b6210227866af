//! Intercept core
//!
//! Runs external SDR and wireless decoders on behalf of a set of operating
//! modes: discovers the hardware, hands each device to one mode at a time,
//! supervises the decoder pipelines, turns their output into typed events and
//! fans those out to every subscriber.

pub mod arbiter;
pub mod broadcast;
pub mod config;
pub mod controller;
pub mod correlation;
pub mod device;
pub mod event;
pub mod history;
pub mod mode;
pub mod parser;
pub mod supervisor;

pub use arbiter::{AirmonNg, ArbiterError, DeviceStatus, Grant, MonitorControl, ResourceArbiter};
pub use broadcast::{BroadcastReport, EventBroadcaster, Received, Subscriber};
pub use config::Config;
pub use controller::{ControlError, HealthReport, KillAllReport, ModeController, ModeStatus};
pub use correlation::{Correlation, Correlator, ObservationLog};
pub use device::{discover, Device, DeviceClass, DeviceRegistry};
pub use event::{Event, EventPayload};
pub use history::{SignalHistory, SignalReading};
pub use mode::{ModeKind, ModeParams, ModeState};
