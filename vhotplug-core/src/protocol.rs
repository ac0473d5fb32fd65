//! Wire protocol for the control API.
//!
//! # Wire format
//!
//! Newline-delimited JSON, UTF-8, over TCP, VSOCK or UNIX sockets. Each
//! request is one object with an `action` field; each reply is one object
//! with `result: "ok" | "failed"`. Clients that enabled notifications also
//! receive unsolicited `{"event": …}` objects.

use crate::error::Error;
use crate::types::{PciDevice, UsbDevice};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A selector naming exactly one connected USB device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbSelector {
    Node(String),
    BusPort { bus: u8, port: String },
    VidPid { vid: String, pid: String },
}

impl std::fmt::Display for UsbSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsbSelector::Node(node) => write!(f, "{}", node),
            UsbSelector::BusPort { bus, port } => write!(f, "bus {} port {}", bus, port),
            UsbSelector::VidPid { vid, pid } => write!(f, "{}:{}", vid, pid),
        }
    }
}

/// A selector naming exactly one PCI device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PciSelector {
    Address(String),
    VidDid { vid: String, did: String },
}

impl std::fmt::Display for PciSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PciSelector::Address(address) => write!(f, "{}", address),
            PciSelector::VidDid { vid, did } => write!(f, "{}:{}", vid, did),
        }
    }
}

/// A parsed API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    EnableNotifications,
    UsbList,
    UsbAttach { selector: UsbSelector, vm: String },
    UsbDetach { selector: UsbSelector },
    PciList,
    PciAttach { selector: PciSelector, vm: String },
    PciDetach { selector: PciSelector },
}

/// Why an inbound line could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Not a JSON object with an `action` string.
    InvalidJson,
    /// Well-formed request for an action this server does not know.
    UnknownAction(String),
    /// Known action with a missing or contradictory payload.
    BadRequest(String),
}

impl RequestError {
    pub fn message(&self) -> String {
        match self {
            RequestError::InvalidJson => "invalid json".to_string(),
            RequestError::UnknownAction(_) => "unknown action".to_string(),
            RequestError::BadRequest(reason) => reason.clone(),
        }
    }
}

fn string_field(msg: &Value, name: &str) -> Option<String> {
    msg.get(name).and_then(Value::as_str).map(str::to_string)
}

fn usb_selector(msg: &Value) -> Result<UsbSelector, RequestError> {
    let node = string_field(msg, "device_node");
    let bus = msg.get("bus").and_then(Value::as_u64);
    let port = string_field(msg, "port");
    let vid = string_field(msg, "vid");
    let pid = string_field(msg, "pid");

    match (node, bus, port, vid, pid) {
        (Some(node), None, None, None, None) => Ok(UsbSelector::Node(node)),
        (None, Some(bus), Some(port), None, None) => {
            let bus = u8::try_from(bus)
                .map_err(|_| RequestError::BadRequest("bus out of range".to_string()))?;
            Ok(UsbSelector::BusPort { bus, port })
        }
        (None, None, None, Some(vid), Some(pid)) => {
            Ok(UsbSelector::VidPid { vid: vid.to_lowercase(), pid: pid.to_lowercase() })
        }
        _ => Err(RequestError::BadRequest(
            "expected exactly one of device_node, bus+port or vid+pid".to_string(),
        )),
    }
}

fn pci_selector(msg: &Value) -> Result<PciSelector, RequestError> {
    let address = string_field(msg, "address");
    let vid = string_field(msg, "vid");
    let did = string_field(msg, "did");

    match (address, vid, did) {
        (Some(address), None, None) => Ok(PciSelector::Address(address.to_lowercase())),
        (None, Some(vid), Some(did)) => {
            Ok(PciSelector::VidDid { vid: vid.to_lowercase(), did: did.to_lowercase() })
        }
        _ => Err(RequestError::BadRequest(
            "expected exactly one of address or vid+did".to_string(),
        )),
    }
}

fn vm_field(msg: &Value) -> Result<String, RequestError> {
    string_field(msg, "vm").ok_or_else(|| RequestError::BadRequest("missing vm".to_string()))
}

impl Request {
    /// Parse one inbound line.
    pub fn parse(line: &str) -> Result<Self, RequestError> {
        let msg: Value = serde_json::from_str(line).map_err(|_| RequestError::InvalidJson)?;
        let action = msg
            .get("action")
            .and_then(Value::as_str)
            .ok_or(RequestError::InvalidJson)?;

        match action {
            "enable_notifications" => Ok(Request::EnableNotifications),
            "usb_list" => Ok(Request::UsbList),
            "usb_attach" => {
                Ok(Request::UsbAttach { selector: usb_selector(&msg)?, vm: vm_field(&msg)? })
            }
            "usb_detach" => Ok(Request::UsbDetach { selector: usb_selector(&msg)? }),
            "pci_list" => Ok(Request::PciList),
            "pci_attach" => {
                Ok(Request::PciAttach { selector: pci_selector(&msg)?, vm: vm_field(&msg)? })
            }
            "pci_detach" => Ok(Request::PciDetach { selector: pci_selector(&msg)? }),
            other => Err(RequestError::UnknownAction(other.to_string())),
        }
    }
}

/// USB device as reported over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbDeviceJson {
    pub device_node: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_vms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
}

impl UsbDeviceJson {
    pub fn new(dev: &UsbDevice) -> Self {
        Self {
            device_node: dev.device_node(),
            vid: Some(dev.vid.clone()),
            pid: Some(dev.pid.clone()),
            vendor_name: dev.vendor_name.clone(),
            product_name: dev.product_name.clone(),
            bus: Some(dev.bus),
            port: Some(dev.port.clone()),
            allowed_vms: None,
            vm: None,
        }
    }

    pub fn with_vms(mut self, allowed_vms: Vec<String>, vm: Option<String>) -> Self {
        self.allowed_vms = Some(allowed_vms);
        self.vm = vm;
        self
    }
}

/// PCI device as reported over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDeviceJson {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_vms: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vm: Option<String>,
}

impl PciDeviceJson {
    pub fn new(dev: &PciDevice) -> Self {
        Self {
            address: dev.address.clone(),
            vid: Some(dev.vid.clone()),
            did: Some(dev.did.clone()),
            description: dev.description.clone(),
            allowed_vms: None,
            vm: None,
        }
    }

    pub fn with_vms(mut self, allowed_vms: Vec<String>, vm: Option<String>) -> Self {
        self.allowed_vms = Some(allowed_vms);
        self.vm = vm;
        self
    }
}

/// Build an `{"result": "ok"}` reply, optionally with extra fields.
pub fn ok_response() -> Value {
    json!({"result": "ok"})
}

pub fn ok_response_with(field: &str, value: Value) -> Value {
    let mut response = ok_response();
    response[field] = value;
    response
}

/// Build a `{"result": "failed"}` reply from an error.
///
/// The `error` field carries the stable short form ("ambiguous", "no such
/// device"), the same register as the parse-level "invalid json" and
/// "unknown action" replies; the full description travels in `message`.
pub fn error_response(error: &Error) -> Value {
    json!({
        "result": "failed",
        "error": error.code().replace('_', " "),
        "code": error.code(),
        "message": error.to_string(),
    })
}

pub fn failed_response(message: &str) -> Value {
    json!({"result": "failed", "error": message})
}

/// An asynchronous event pushed to subscribed clients.
#[derive(Debug, Clone)]
pub enum Notification {
    UsbConnected(UsbDeviceJson),
    UsbDisconnected(UsbDeviceJson),
    UsbAttached { device: UsbDeviceJson, vm: String },
    UsbDetached { device: UsbDeviceJson, vm: String },
    UsbSelectVm { device: UsbDeviceJson, allowed_vms: Vec<String> },
    PciAttached { device: PciDeviceJson, vm: String },
    PciDetached { device: PciDeviceJson, vm: String },
}

impl Notification {
    pub fn event(&self) -> &'static str {
        match self {
            Notification::UsbConnected(_) => "usb_connected",
            Notification::UsbDisconnected(_) => "usb_disconnected",
            Notification::UsbAttached { .. } => "usb_attached",
            Notification::UsbDetached { .. } => "usb_detached",
            Notification::UsbSelectVm { .. } => "usb_select_vm",
            Notification::PciAttached { .. } => "pci_attached",
            Notification::PciDetached { .. } => "pci_detached",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Notification::UsbConnected(device) | Notification::UsbDisconnected(device) => {
                json!({"event": self.event(), "usb_device": device})
            }
            Notification::UsbAttached { device, vm } | Notification::UsbDetached { device, vm } => {
                json!({"event": self.event(), "usb_device": device, "vm": vm})
            }
            Notification::UsbSelectVm { device, allowed_vms } => {
                json!({"event": self.event(), "usb_device": device, "allowed_vms": allowed_vms})
            }
            Notification::PciAttached { device, vm } | Notification::PciDetached { device, vm } => {
                json!({"event": self.event(), "pci_device": device, "vm": vm})
            }
        }
    }
}
