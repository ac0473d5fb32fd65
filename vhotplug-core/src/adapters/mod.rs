//! Hypervisor adapter abstraction.
//!
//! vhotplug drives multiple hypervisors via the `VmAdapter` trait:
//! - qemu: QMP over a UNIX socket
//! - crosvm: the crosvm control socket
//!
//! One adapter instance exists per configured VM and owns that VM's control
//! channel. Adapters reconnect lazily with exponential backoff; commands
//! carry a per-command deadline. Unsupported operations report
//! `Error::Unsupported` rather than failing silently.

use crate::config::{GeneralConfig, VmSpec, VmType};
use crate::error::Result;
use crate::types::{EvdevDevice, PciDevice, UsbDevice};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub mod crosvm;
pub mod qemu;

pub use crosvm::CrosvmAdapter;
pub use qemu::QemuAdapter;

/// Default per-command deadline.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Hypervisor adapter trait.
///
/// All hypervisor integrations implement this. Commands to one VM are
/// serialized by the orchestrator; implementations additionally guard their
/// control channel so a stray concurrent caller cannot interleave frames.
#[async_trait]
pub trait VmAdapter: Send + Sync {
    /// VM name this adapter serves (for logging).
    fn name(&self) -> &str;

    /// Supported operations (for feature detection).
    fn capabilities(&self) -> AdapterCapabilities;

    /// Pass a USB host device through to the VM.
    ///
    /// Idempotent: a hypervisor report that the device id already exists is
    /// success.
    async fn attach_usb(&self, dev: &UsbDevice) -> Result<()>;

    /// Remove a previously attached USB device.
    async fn detach_usb(&self, dev: &UsbDevice) -> Result<()>;

    /// Pass a PCI device through via VFIO.
    async fn attach_pci(&self, dev: &PciDevice) -> Result<()>;

    /// Remove a previously attached PCI device.
    async fn detach_pci(&self, dev: &PciDevice) -> Result<()>;

    /// Attach a host input device on the given guest bus slot.
    async fn attach_evdev(&self, dev: &EvdevDevice, bus: &str) -> Result<()>;

    /// Close the control channel. Terminal: later commands fail.
    async fn shutdown(&self);
}

/// Operations an adapter supports.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterCapabilities {
    pub usb: bool,
    pub pci: bool,
    pub evdev: bool,
}

/// Build the adapter matching a VM's type.
pub fn adapter_for(spec: &VmSpec, general: &GeneralConfig) -> Arc<dyn VmAdapter> {
    match spec.vm_type {
        VmType::Qemu => Arc::new(QemuAdapter::new(&spec.name, &spec.socket)),
        VmType::Crosvm => Arc::new(CrosvmAdapter::new(
            &spec.name,
            &spec.socket,
            general.crosvm.as_deref(),
        )),
    }
}
