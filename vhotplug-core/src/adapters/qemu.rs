//! QEMU adapter: hot-plug via QMP.
//!
//! Connection lifecycle: Disconnected → Ready on a successful handshake,
//! back to Disconnected on any transport error or command timeout, Closed
//! on shutdown. Reconnection happens lazily on the next command, gated by
//! exponential backoff (250 ms doubling to a 5 s cap). A command-level QMP
//! error leaves the channel connected; only framing violations and I/O
//! errors tear it down.

use crate::adapters::{AdapterCapabilities, VmAdapter, COMMAND_TIMEOUT};
use crate::error::{Error, Result};
use crate::qmp::{QmpClient, QmpError, QmpReply};
use crate::types::{DeviceKey, EvdevDevice, PciDevice, UsbDevice};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct Backoff {
    delay: Duration,
    not_before: Option<Instant>,
}

impl Backoff {
    fn new() -> Self {
        Self { delay: BACKOFF_INITIAL, not_before: None }
    }

    fn ready(&self) -> bool {
        self.not_before.map(|t| Instant::now() >= t).unwrap_or(true)
    }

    fn failure(&mut self) {
        self.not_before = Some(Instant::now() + self.delay);
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

struct ConnState {
    client: Option<QmpClient>,
    backoff: Backoff,
    closed: bool,
}

/// Adapter for one QEMU VM.
pub struct QemuAdapter {
    name: String,
    socket_path: PathBuf,
    state: Mutex<ConnState>,
    deadline: Duration,
}

impl QemuAdapter {
    pub fn new(name: &str, socket_path: &Path) -> Self {
        Self {
            name: name.to_string(),
            socket_path: socket_path.to_path_buf(),
            state: Mutex::new(ConnState {
                client: None,
                backoff: Backoff::new(),
                closed: false,
            }),
            deadline: COMMAND_TIMEOUT,
        }
    }

    fn unreachable(&self, reason: impl Into<String>) -> Error {
        Error::VmUnreachable { vm: self.name.clone(), reason: reason.into() }
    }

    fn protocol_error(&self, reason: impl Into<String>) -> Error {
        Error::ProtocolError { vm: self.name.clone(), reason: reason.into() }
    }

    /// Run one QMP command, connecting first if needed.
    async fn execute(&self, command: &str, arguments: Value) -> Result<QmpReply> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(self.unreachable("adapter is shut down"));
        }

        if state.client.is_none() {
            if !state.backoff.ready() {
                return Err(self.unreachable("reconnect backoff in effect"));
            }
            debug!(vm = %self.name, socket = %self.socket_path.display(), "connecting to QMP");
            match timeout(self.deadline, QmpClient::connect(&self.socket_path)).await {
                Err(_) => {
                    state.backoff.failure();
                    return Err(Error::Timeout { vm: self.name.clone() });
                }
                Ok(Err(QmpError::Io(e))) => {
                    state.backoff.failure();
                    return Err(self.unreachable(e.to_string()));
                }
                Ok(Err(QmpError::Malformed(reason))) => {
                    state.backoff.failure();
                    return Err(self.protocol_error(reason));
                }
                Ok(Ok(client)) => {
                    info!(vm = %self.name, "QMP connection established");
                    state.client = Some(client);
                    state.backoff.reset();
                }
            }
        }

        let client = state.client.as_mut().expect("client connected above");
        match timeout(self.deadline, client.execute(command, Some(arguments))).await {
            Err(_) => {
                state.client = None;
                Err(Error::Timeout { vm: self.name.clone() })
            }
            Ok(Err(QmpError::Io(e))) => {
                state.client = None;
                Err(self.unreachable(e.to_string()))
            }
            Ok(Err(QmpError::Malformed(reason))) => {
                state.client = None;
                Err(self.protocol_error(reason))
            }
            Ok(Ok(reply)) => Ok(reply),
        }
    }

    /// `device_add` with idempotence: a duplicate id means the device is
    /// already attached, which is success.
    async fn device_add(&self, id: &str, arguments: Value) -> Result<()> {
        match self.execute("device_add", arguments).await? {
            QmpReply::Return(_) => Ok(()),
            reply if reply.desc_starts_with("Duplicate device ID") => {
                info!(vm = %self.name, id = %id, "device already attached");
                Ok(())
            }
            QmpReply::Error { class, desc } => {
                Err(self.protocol_error(format!("device_add {}: {} ({})", id, desc, class)))
            }
        }
    }

    /// `device_del` with idempotence: an unknown id means the device is
    /// already gone.
    async fn device_del(&self, id: &str) -> Result<()> {
        match self.execute("device_del", json!({"id": id})).await? {
            QmpReply::Return(_) => Ok(()),
            reply if reply.is_error_class("DeviceNotFound") => {
                debug!(vm = %self.name, id = %id, "device not present in guest");
                Ok(())
            }
            QmpReply::Error { class, desc } => {
                Err(self.protocol_error(format!("device_del {}: {} ({})", id, desc, class)))
            }
        }
    }
}

#[async_trait]
impl VmAdapter for QemuAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities { usb: true, pci: true, evdev: true }
    }

    async fn attach_usb(&self, dev: &UsbDevice) -> Result<()> {
        let id = dev.key().hypervisor_id();
        info!(
            vm = %self.name, id = %id, bus = dev.bus, addr = dev.address,
            "attaching USB device {}", dev.friendly_name()
        );
        self.device_add(
            &id,
            json!({
                "driver": "usb-host",
                "id": id,
                "hostbus": dev.bus,
                "hostaddr": dev.address,
            }),
        )
        .await
    }

    async fn detach_usb(&self, dev: &UsbDevice) -> Result<()> {
        let id = dev.key().hypervisor_id();
        info!(vm = %self.name, id = %id, "detaching USB device {}", dev.friendly_name());
        self.device_del(&id).await
    }

    async fn attach_pci(&self, dev: &PciDevice) -> Result<()> {
        let id = dev.key().hypervisor_id();
        info!(vm = %self.name, id = %id, host = %dev.address, "attaching PCI device");
        self.device_add(
            &id,
            json!({
                "driver": "vfio-pci",
                "id": id,
                "host": dev.address,
            }),
        )
        .await
    }

    async fn detach_pci(&self, dev: &PciDevice) -> Result<()> {
        let id = dev.key().hypervisor_id();
        info!(vm = %self.name, id = %id, "detaching PCI device");
        self.device_del(&id).await
    }

    async fn attach_evdev(&self, dev: &EvdevDevice, bus: &str) -> Result<()> {
        let id = DeviceKey::Evdev { node: dev.node.clone() }.hypervisor_id();
        info!(vm = %self.name, id = %id, bus = %bus, "attaching evdev device {}", dev.friendly_name());
        self.device_add(
            &id,
            json!({
                "driver": "virtio-input-host-pci",
                "id": id,
                "evdev": dev.node,
                "bus": bus,
            }),
        )
        .await
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.client.take().is_some() {
            debug!(vm = %self.name, "QMP connection closed");
        }
        state.closed = true;
    }
}

impl Drop for QemuAdapter {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            if state.client.is_some() {
                warn!(vm = %self.name, "adapter dropped with open QMP connection");
            }
        }
    }
}
