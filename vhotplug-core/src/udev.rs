//! Kernel device source.
//!
//! Watches a udev netlink monitor filtered to the usb, pci and input
//! subsystems and turns raw devices into typed [`DeviceEvent`]s. The
//! monitor socket is not `Send`, so it lives on a dedicated thread with a
//! current-thread runtime; typed events cross into the daemon through a
//! bounded channel. A full queue means a hot-plug event would be lost, so
//! the source shuts down loudly instead of dropping it.

use crate::error::{Error, Result};
use crate::types::pci::parse_class_code;
use crate::types::usb::parse_interfaces;
use crate::types::{EvdevDevice, HostDevice, PciDevice, UsbDevice};
use crate::usb_ids::UsbIdDb;
use futures::StreamExt;
use std::sync::Arc;
use tokio::runtime::Builder;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_udev::{AsyncMonitorSocket, Device, Enumerator, EventType, MonitorBuilder};
use tracing::{debug, error, info, warn};

/// Depth of the event queue between the monitor thread and the orchestrator.
pub const EVENT_QUEUE_DEPTH: usize = 256;

const SUBSYSTEMS: &[&str] = &["usb", "pci", "input"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Add,
    Remove,
    Change,
}

/// One typed hot-plug event.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub action: EventAction,
    pub device: HostDevice,
}

/// Handle to the running monitor thread.
pub struct DeviceSource {
    receiver: mpsc::Receiver<DeviceEvent>,
}

impl DeviceSource {
    /// Start the monitor. With `attach_connected`, currently-present
    /// devices are emitted as synthetic `add` events before live ones.
    pub fn start(attach_connected: bool, usb_ids: Arc<UsbIdDb>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("udev-monitor".into())
            .spawn(move || {
                if let Err(e) = monitor_thread(tx, attach_connected, usb_ids) {
                    error!("udev monitor failed: {}", e);
                }
            })
            .map_err(|e| Error::SourceLost { reason: format!("failed to spawn monitor: {}", e) })?;
        Ok(Self { receiver: rx })
    }

    /// Next event; `None` means the monitor is gone (`SourceLost`).
    pub async fn recv(&mut self) -> Option<DeviceEvent> {
        self.receiver.recv().await
    }
}

fn monitor_thread(
    tx: mpsc::Sender<DeviceEvent>,
    attach_connected: bool,
    usb_ids: Arc<UsbIdDb>,
) -> Result<()> {
    // The monitor socket is not Send, so the whole task runs on this
    // thread's own single-threaded runtime.
    let rt = Builder::new_current_thread().enable_all().build().map_err(|e| {
        Error::SourceLost { reason: format!("failed to build monitor runtime: {}", e) }
    })?;
    rt.block_on(monitor_task(tx, attach_connected, usb_ids))
}

async fn monitor_task(
    tx: mpsc::Sender<DeviceEvent>,
    attach_connected: bool,
    usb_ids: Arc<UsbIdDb>,
) -> Result<()> {
    // Open the monitor before enumerating so devices plugged during
    // enumeration are not missed, only seen twice (attach is idempotent).
    let mut builder = MonitorBuilder::new()
        .map_err(|e| Error::SourceLost { reason: format!("failed to open monitor: {}", e) })?;
    for subsystem in SUBSYSTEMS {
        builder = builder.match_subsystem(subsystem).map_err(|e| Error::SourceLost {
            reason: format!("failed to filter {}: {}", subsystem, e),
        })?;
    }
    let socket = builder
        .listen()
        .and_then(AsyncMonitorSocket::new)
        .map_err(|e| Error::SourceLost { reason: format!("failed to listen: {}", e) })?;

    if attach_connected {
        // Synthetic add events may exceed the queue depth on large hosts;
        // waiting here is fine, the live monitor is already buffering.
        for event in enumerate_connected(&usb_ids)? {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }
    }

    info!("waiting for device events");
    let mut socket = socket;
    while let Some(event) = socket.next().await {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                return Err(Error::SourceLost { reason: format!("monitor read failed: {}", e) })
            }
        };
        let action = match event.event_type() {
            EventType::Add => EventAction::Add,
            EventType::Remove => EventAction::Remove,
            EventType::Change => EventAction::Change,
            _ => continue,
        };
        let Some(device) = normalize(&event.device(), &usb_ids) else {
            continue;
        };
        push(&tx, DeviceEvent { action, device })?;
    }

    Err(Error::SourceLost { reason: "udev monitor stream ended".to_string() })
}

/// Build synthetic add events for everything currently connected.
fn enumerate_connected(usb_ids: &UsbIdDb) -> Result<Vec<DeviceEvent>> {
    info!("enumerating connected devices");
    let mut events = Vec::new();
    for subsystem in SUBSYSTEMS {
        let mut enumerator = Enumerator::new().map_err(|e| Error::SourceLost {
            reason: format!("failed to enumerate: {}", e),
        })?;
        enumerator.match_subsystem(subsystem).map_err(|e| Error::SourceLost {
            reason: format!("failed to enumerate {}: {}", subsystem, e),
        })?;
        let devices = enumerator.scan_devices().map_err(|e| Error::SourceLost {
            reason: format!("failed to scan {}: {}", subsystem, e),
        })?;
        for device in devices {
            if let Some(device) = normalize(&device, usb_ids) {
                events.push(DeviceEvent { action: EventAction::Add, device });
            }
        }
    }
    Ok(events)
}

fn push(tx: &mpsc::Sender<DeviceEvent>, event: DeviceEvent) -> Result<()> {
    match tx.try_send(event) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(event)) => {
            // Dropping a hot-plug event would desynchronize the registry
            // from the host; terminate and let the service manager restart.
            error!("event queue overflowed at {}", event.device.key());
            Err(Error::SourceLost { reason: "event queue overflow".to_string() })
        }
        Err(TrySendError::Closed(_)) => {
            debug!("orchestrator gone, stopping monitor");
            Ok(())
        }
    }
}

fn property(device: &Device, name: &str) -> Option<String> {
    device.property_value(name).and_then(|v| v.to_str()).map(str::to_string)
}

fn attribute(device: &Device, name: &str) -> Option<String> {
    device.attribute_value(name).and_then(|v| v.to_str()).map(|s| s.trim().to_string())
}

fn hex_attribute_u8(device: &Device, name: &str) -> Option<u8> {
    attribute(device, name).and_then(|v| u8::from_str_radix(&v, 16).ok())
}

/// Root-port path from a USB sysname: `3-2.4` → `2.4`, root hubs → `0`.
fn port_from_sysname(sysname: &str) -> String {
    sysname.split_once('-').map(|(_, port)| port.to_string()).unwrap_or_else(|| "0".to_string())
}

/// Lift a raw udev device into a typed record.
///
/// Devices outside the recognized set (interfaces, non-event input nodes,
/// unsupported subsystems) normalize to `None` and are dropped silently.
pub fn normalize(device: &Device, usb_ids: &UsbIdDb) -> Option<HostDevice> {
    let subsystem = device.subsystem()?.to_str()?.to_string();
    match subsystem.as_str() {
        "usb" => normalize_usb(device, usb_ids).map(HostDevice::Usb),
        "pci" => normalize_pci(device).map(HostDevice::Pci),
        "input" => normalize_input(device).map(HostDevice::Input),
        other => {
            debug!(subsystem = %other, "unsupported subsystem");
            None
        }
    }
}

fn normalize_usb(device: &Device, usb_ids: &UsbIdDb) -> Option<UsbDevice> {
    // Only whole devices; usb_interface children are folded into the
    // interfaces list via ID_USB_INTERFACES.
    if device.devtype()?.to_str()? != "usb_device" {
        return None;
    }

    let bus: u8 = property(device, "BUSNUM")?.parse().ok()?;
    let address: u8 = property(device, "DEVNUM")?.parse().ok()?;
    let sysname = device.sysname().to_str()?.to_string();

    let vid = property(device, "ID_VENDOR_ID")?.to_lowercase();
    let pid = property(device, "ID_MODEL_ID")?.to_lowercase();

    let (db_vendor, db_product) = usb_ids.lookup(&vid, &pid);
    let vendor_name = property(device, "ID_VENDOR_FROM_DATABASE")
        .or_else(|| property(device, "ID_VENDOR"))
        .or(db_vendor);
    let product_name = property(device, "ID_MODEL_FROM_DATABASE")
        .or_else(|| property(device, "ID_MODEL"))
        .or(db_product);

    // Attributes live in sysfs and are unreadable once the device is gone;
    // a remove event still normalizes because only the key matters then.
    let device_class = hex_attribute_u8(device, "bDeviceClass").unwrap_or(0);
    let device_subclass = hex_attribute_u8(device, "bDeviceSubClass").unwrap_or(0);
    let device_protocol = hex_attribute_u8(device, "bDeviceProtocol").unwrap_or(0);
    let interfaces = property(device, "ID_USB_INTERFACES")
        .map(|raw| parse_interfaces(&raw))
        .unwrap_or_default();

    Some(UsbDevice {
        bus,
        address,
        port: port_from_sysname(&sysname),
        vid,
        pid,
        vendor_name,
        product_name,
        device_class,
        device_subclass,
        device_protocol,
        interfaces,
    })
}

fn normalize_pci(device: &Device) -> Option<PciDevice> {
    let address = device.sysname().to_str()?.to_string();
    let pci_id = property(device, "PCI_ID")?;
    let (vid, did) = pci_id.split_once(':')?;
    let class_code = property(device, "PCI_CLASS")?;
    let (device_class, device_subclass, device_prog_if) = parse_class_code(&class_code)?;
    let driver = device.driver().and_then(|d| d.to_str()).map(str::to_string);
    let description = property(device, "ID_MODEL_FROM_DATABASE");

    Some(PciDevice {
        address,
        vid: vid.to_lowercase(),
        did: did.to_lowercase(),
        device_class,
        device_subclass,
        device_prog_if,
        description,
        driver,
    })
}

/// Input devices eligible for evdev passthrough: event nodes of pointing
/// and typing hardware that did not enter the host over USB (USB input
/// devices are passed through whole via usb-host).
fn normalize_input(device: &Device) -> Option<EvdevDevice> {
    let sysname = device.sysname().to_str()?;
    if !sysname.starts_with("event") {
        return None;
    }
    if property(device, "ID_INPUT").as_deref() != Some("1") {
        return None;
    }
    const INPUT_KINDS: &[&str] = &[
        "ID_INPUT_MOUSE",
        "ID_INPUT_KEYBOARD",
        "ID_INPUT_TOUCHPAD",
        "ID_INPUT_TOUCHSCREEN",
        "ID_INPUT_TABLET",
    ];
    if !INPUT_KINDS.iter().any(|kind| property(device, kind).as_deref() == Some("1")) {
        return None;
    }
    if property(device, "ID_BUS").as_deref() == Some("usb") {
        return None;
    }

    let node = device.devnode()?.to_str()?.to_string();
    let parent = device.parent();
    let (name, phys, unique) = match &parent {
        Some(parent) => (
            attribute(parent, "name"),
            attribute(parent, "phys"),
            attribute(parent, "uniq").filter(|s| !s.is_empty()),
        ),
        None => (None, None, None),
    };
    if name.is_none() {
        warn!(node = %node, "input device without a name attribute");
    }

    Some(EvdevDevice { node, name, phys, unique })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_parsing() {
        assert_eq!(port_from_sysname("3-2.4"), "2.4");
        assert_eq!(port_from_sysname("1-1"), "1");
        assert_eq!(port_from_sysname("usb3"), "0");
    }
}
