//! Typed device records.
//!
//! udev delivers string-keyed attribute maps; this module is the single
//! place that lifts them into typed records so the rule engine can match
//! exhaustively. Records are immutable: a udev `change` event replaces the
//! record, it is never mutated in place.

pub mod evdev;
pub mod pci;
pub mod usb;

pub use evdev::EvdevDevice;
pub use pci::PciDevice;
pub use usb::{UsbDevice, UsbInterface};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique name of a device inside the attachment registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKey {
    /// USB device identified by bus number and device address.
    Usb { bus: u8, address: u8 },
    /// PCI device identified by its `DDDD:BB:DD.F` address.
    Pci { address: String },
    /// Input device identified by its `/dev/input/eventN` node.
    Evdev { node: String },
}

/// Device kind, used for registry queries and notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Usb,
    Pci,
    Evdev,
}

impl DeviceKey {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceKey::Usb { .. } => DeviceKind::Usb,
            DeviceKey::Pci { .. } => DeviceKind::Pci,
            DeviceKey::Evdev { .. } => DeviceKind::Evdev,
        }
    }

    /// Deterministic hypervisor-side device id.
    ///
    /// Reconnect after a crash must be able to issue `device_del` for a
    /// device it did not attach in this process lifetime, so the id is a
    /// pure function of the key. Colons in PCI addresses are replaced with
    /// dashes to stay within QEMU's id character set.
    pub fn hypervisor_id(&self) -> String {
        match self {
            DeviceKey::Usb { bus, address } => format!("vhp-usb-{}-{}", bus, address),
            DeviceKey::Pci { address } => {
                format!("vhp-pci-{}", address.replace(':', "-"))
            }
            DeviceKey::Evdev { node } => {
                let name = node.rsplit('/').next().unwrap_or(node);
                format!("vhp-evdev-{}", name)
            }
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Usb { bus, address } => write!(f, "usb {}:{}", bus, address),
            DeviceKey::Pci { address } => write!(f, "pci {}", address),
            DeviceKey::Evdev { node } => write!(f, "evdev {}", node),
        }
    }
}

/// A normalized host device, any subsystem.
#[derive(Debug, Clone)]
pub enum HostDevice {
    Usb(UsbDevice),
    Pci(PciDevice),
    Input(EvdevDevice),
}

impl HostDevice {
    pub fn key(&self) -> DeviceKey {
        match self {
            HostDevice::Usb(dev) => dev.key(),
            HostDevice::Pci(dev) => dev.key(),
            HostDevice::Input(dev) => dev.key(),
        }
    }
}
