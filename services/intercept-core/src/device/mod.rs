//! Physical capture devices and their discovery

mod discovery;
mod registry;

pub use discovery::discover;
pub use registry::{Capabilities, Device, DeviceClass, DeviceRegistry};
