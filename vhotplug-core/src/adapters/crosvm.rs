//! crosvm adapter: USB hot-plug via the crosvm control socket.
//!
//! The control socket speaks crosvm's own request/response protocol; the
//! stable way to drive it is the `crosvm` binary's `usb attach`, `usb
//! detach` and `usb list` verbs pointed at the socket. Replies come back on
//! stdout as `ok <port>` / `no_available_port` / `devices <idx> <vid>
//! <pid>…`. PCI and evdev passthrough are not available on crosvm.

use crate::adapters::{AdapterCapabilities, VmAdapter, COMMAND_TIMEOUT};
use crate::error::{Error, Result};
use crate::types::{EvdevDevice, PciDevice, UsbDevice};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DEFAULT_CROSVM_BIN: &str = "crosvm";

/// One guest USB port as reported by `crosvm usb list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPort {
    pub index: u32,
    pub vid: String,
    pub pid: String,
}

/// Parse `crosvm usb list` output: `devices <idx> <vid> <pid> [<idx> …]`.
pub fn parse_usb_list(stdout: &str) -> Option<Vec<GuestPort>> {
    let mut tokens = stdout.split_whitespace();
    if tokens.next()? != "devices" {
        return None;
    }
    let rest: Vec<&str> = tokens.collect();
    let mut ports = Vec::new();
    for chunk in rest.chunks(3) {
        if let [index, vid, pid] = chunk {
            ports.push(GuestPort {
                index: index.parse().ok()?,
                vid: vid.to_lowercase(),
                pid: pid.to_lowercase(),
            });
        }
    }
    Some(ports)
}

/// First token of an attach/detach reply (`ok`, `no_available_port`, …).
pub fn parse_reply_status(stdout: &str) -> Option<&str> {
    stdout.split_whitespace().next()
}

/// Adapter for one crosvm VM.
pub struct CrosvmAdapter {
    name: String,
    socket_path: PathBuf,
    crosvm_bin: String,
    deadline: Duration,
}

impl CrosvmAdapter {
    pub fn new(name: &str, socket_path: &Path, crosvm_bin: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            socket_path: socket_path.to_path_buf(),
            crosvm_bin: crosvm_bin.unwrap_or(DEFAULT_CROSVM_BIN).to_string(),
            deadline: COMMAND_TIMEOUT,
        }
    }

    fn unreachable(&self, reason: impl Into<String>) -> Error {
        Error::VmUnreachable { vm: self.name.clone(), reason: reason.into() }
    }

    fn protocol_error(&self, reason: impl Into<String>) -> Error {
        Error::ProtocolError { vm: self.name.clone(), reason: reason.into() }
    }

    fn unsupported(&self, operation: &str) -> Error {
        Error::Unsupported { vm: self.name.clone(), operation: operation.to_string() }
    }

    /// Run one crosvm control verb against the socket and return stdout.
    async fn control(&self, args: &[&str]) -> Result<String> {
        let output = timeout(
            self.deadline,
            Command::new(&self.crosvm_bin)
                .args(args)
                .arg(&self.socket_path)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout { vm: self.name.clone() })?
        .map_err(|e| self.unreachable(format!("failed to run {}: {}", self.crosvm_bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.unreachable(format!(
                "crosvm {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn guest_ports(&self) -> Result<Vec<GuestPort>> {
        let stdout = self.control(&["usb", "list"]).await?;
        parse_usb_list(&stdout)
            .ok_or_else(|| self.protocol_error(format!("unexpected usb list reply: {}", stdout.trim())))
    }
}

#[async_trait]
impl VmAdapter for CrosvmAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities { usb: true, pci: false, evdev: false }
    }

    async fn attach_usb(&self, dev: &UsbDevice) -> Result<()> {
        // Already forwarded? crosvm has no stable device id, so identity is
        // the vid:pid pair on a guest port.
        let ports = self.guest_ports().await?;
        if ports.iter().any(|p| p.vid == dev.vid && p.pid == dev.pid) {
            info!(vm = %self.name, "device {} already attached", dev.friendly_name());
            return Ok(());
        }

        let node = dev.device_node();
        info!(vm = %self.name, node = %node, "attaching USB device {}", dev.friendly_name());
        let stdout = self.control(&["usb", "attach", "00:00:00:00", &node]).await?;
        match parse_reply_status(&stdout) {
            Some("ok") => {
                debug!(vm = %self.name, reply = %stdout.trim(), "attach acknowledged");
                Ok(())
            }
            Some("no_available_port") => {
                Err(self.unreachable("guest has no available USB port"))
            }
            _ => Err(self.protocol_error(format!("unexpected attach reply: {}", stdout.trim()))),
        }
    }

    async fn detach_usb(&self, dev: &UsbDevice) -> Result<()> {
        let ports = self.guest_ports().await?;
        let Some(port) = ports.iter().find(|p| p.vid == dev.vid && p.pid == dev.pid) else {
            debug!(vm = %self.name, "device {} not present in guest", dev.friendly_name());
            return Ok(());
        };

        info!(vm = %self.name, port = port.index, "detaching USB device {}", dev.friendly_name());
        let stdout = self.control(&["usb", "detach", &port.index.to_string()]).await?;
        match parse_reply_status(&stdout) {
            Some("ok") => Ok(()),
            _ => Err(self.protocol_error(format!("unexpected detach reply: {}", stdout.trim()))),
        }
    }

    async fn attach_pci(&self, _dev: &PciDevice) -> Result<()> {
        Err(self.unsupported("pci attach"))
    }

    async fn detach_pci(&self, _dev: &PciDevice) -> Result<()> {
        Err(self.unsupported("pci detach"))
    }

    async fn attach_evdev(&self, _dev: &EvdevDevice, _bus: &str) -> Result<()> {
        Err(self.unsupported("evdev attach"))
    }

    async fn shutdown(&self) {
        // Nothing persistent to close; each verb is a fresh control request.
        warn!(vm = %self.name, "crosvm adapter shut down");
    }
}
