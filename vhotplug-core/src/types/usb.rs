//! USB device record.

use super::DeviceKey;
use serde::{Deserialize, Serialize};

/// Interface class 9 marks hubs, which are never passthrough candidates.
const USB_CLASS_HUB: u8 = 9;

/// One `(class, subclass, protocol)` tuple of a USB interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// A connected USB device.
///
/// Identity is `(bus, address)`: the pair uniquely names a connected device
/// and maps 1:1 to its `/dev/bus/usb/<bus>/<address>` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// Bus number (udev `BUSNUM`).
    pub bus: u8,
    /// Device address on the bus (udev `DEVNUM`).
    pub address: u8,
    /// Root-port path, e.g. `"1"` or `"2.4"`.
    pub port: String,
    /// Vendor id, 4 lowercase hex digits.
    pub vid: String,
    /// Product id, 4 lowercase hex digits.
    pub pid: String,
    pub vendor_name: Option<String>,
    pub product_name: Option<String>,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Interface tuples collected from the device's interface children.
    pub interfaces: Vec<UsbInterface>,
}

impl UsbDevice {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::Usb { bus: self.bus, address: self.address }
    }

    /// Character device node, `/dev/bus/usb/BBB/DDD`.
    pub fn device_node(&self) -> String {
        format!("/dev/bus/usb/{:03}/{:03}", self.bus, self.address)
    }

    /// Parse `(bus, address)` back out of a `/dev/bus/usb/BBB/DDD` node path.
    pub fn parse_device_node(node: &str) -> Option<(u8, u8)> {
        let rest = node.strip_prefix("/dev/bus/usb/")?;
        let (bus, address) = rest.split_once('/')?;
        Some((bus.parse().ok()?, address.parse().ok()?))
    }

    pub fn is_hub(&self) -> bool {
        self.interfaces.iter().any(|i| i.class == USB_CLASS_HUB)
    }

    /// Short human-readable label for log lines.
    pub fn friendly_name(&self) -> String {
        match (&self.vendor_name, &self.product_name) {
            (Some(vendor), Some(product)) => {
                format!("{}:{} ({} {})", self.vid, self.pid, vendor, product)
            }
            (Some(name), None) | (None, Some(name)) => {
                format!("{}:{} ({})", self.vid, self.pid, name)
            }
            (None, None) => format!("{}:{}", self.vid, self.pid),
        }
    }
}

/// Parse the udev `ID_USB_INTERFACES` property, e.g. `":030101:080650:"`.
///
/// Each colon-separated entry is six hex digits: class, subclass, protocol.
/// Malformed entries are skipped.
pub fn parse_interfaces(raw: &str) -> Vec<UsbInterface> {
    raw.split(':')
        .filter(|entry| entry.len() >= 6)
        .filter_map(|entry| {
            let class = u8::from_str_radix(&entry[0..2], 16).ok()?;
            let subclass = u8::from_str_radix(&entry[2..4], 16).ok()?;
            let protocol = u8::from_str_radix(&entry[4..6], 16).ok()?;
            Some(UsbInterface { class, subclass, protocol })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> UsbDevice {
        UsbDevice {
            bus: 3,
            address: 7,
            port: "2.4".into(),
            vid: "046d".into(),
            pid: "c077".into(),
            vendor_name: Some("Logitech".into()),
            product_name: Some("USB Optical Mouse".into()),
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            interfaces: vec![UsbInterface { class: 3, subclass: 1, protocol: 2 }],
        }
    }

    #[test]
    fn device_node_is_zero_padded() {
        assert_eq!(device().device_node(), "/dev/bus/usb/003/007");
    }

    #[test]
    fn device_node_round_trips() {
        let dev = device();
        assert_eq!(UsbDevice::parse_device_node(&dev.device_node()), Some((3, 7)));
        assert_eq!(UsbDevice::parse_device_node("/dev/input/event3"), None);
        assert_eq!(UsbDevice::parse_device_node("/dev/bus/usb/003"), None);
    }

    #[test]
    fn parses_interface_string() {
        let parsed = parse_interfaces(":030101:080650:");
        assert_eq!(
            parsed,
            vec![
                UsbInterface { class: 3, subclass: 1, protocol: 1 },
                UsbInterface { class: 8, subclass: 6, protocol: 0x50 },
            ]
        );
    }

    #[test]
    fn skips_malformed_interface_entries() {
        assert_eq!(parse_interfaces(":03:zzzzzz:0e0100:"), vec![UsbInterface {
            class: 0x0e,
            subclass: 1,
            protocol: 0,
        }]);
        assert!(parse_interfaces("").is_empty());
    }

    #[test]
    fn hub_detection() {
        let mut dev = device();
        assert!(!dev.is_hub());
        dev.interfaces = parse_interfaces(":090000:");
        assert!(dev.is_hub());
    }
}
