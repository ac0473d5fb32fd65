//! vhotplug core library.
//!
//! Shared types, rule engine, hypervisor adapters and the kernel device
//! source for the vhotplug daemon.

pub mod adapters;
pub mod config;
pub mod error;
pub mod protocol;
pub mod qmp;
pub mod registry;
pub mod rules;
pub mod types;
pub mod udev;
pub mod usb_ids;
pub mod vfio;

// Re-export commonly used items
pub use config::{ApiConfig, Config, Transport, VmSpec, VmType};
pub use error::{Error, Result};
pub use registry::{Attachment, AttachmentRegistry};
pub use rules::{RuleEngine, Verdict};
pub use types::{DeviceKey, DeviceKind, EvdevDevice, HostDevice, PciDevice, UsbDevice};
pub use udev::{DeviceEvent, DeviceSource, EventAction};
pub use usb_ids::UsbIdDb;
