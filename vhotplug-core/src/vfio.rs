//! VFIO driver binding for PCI passthrough.
//!
//! QEMU's `vfio-pci` device model requires the host device to be bound to
//! the vfio-pci driver. Rebinding goes through sysfs: unbind from the
//! current driver, set `driver_override`, then ask the bus to reprobe.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PCI_DEVICES_PATH: &str = "/sys/bus/pci/devices";
const VFIO_DRIVER: &str = "vfio-pci";

fn sysfs_write(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| Error::Io { path: path.display().to_string(), source: e })
}

/// Current driver of a PCI device, read from the sysfs driver symlink.
pub fn current_driver(address: &str) -> Option<String> {
    let link = PathBuf::from(PCI_DEVICES_PATH).join(address).join("driver");
    fs::read_link(link)
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()))
}

/// Bind a PCI device to vfio-pci, unbinding its current driver first.
///
/// No-op when the device is already bound to vfio-pci.
pub fn bind_vfio(address: &str) -> Result<()> {
    let device_path = PathBuf::from(PCI_DEVICES_PATH).join(address);
    if !device_path.exists() {
        return Err(Error::NoSuchDevice { selector: address.to_string() });
    }

    match current_driver(address) {
        Some(driver) if driver == VFIO_DRIVER => {
            debug!(address = %address, "device already bound to vfio-pci");
            return Ok(());
        }
        Some(driver) => {
            info!(address = %address, driver = %driver, "unbinding current driver");
            sysfs_write(&device_path.join("driver/unbind"), address)?;
        }
        None => {}
    }

    sysfs_write(&device_path.join("driver_override"), VFIO_DRIVER)?;
    sysfs_write(&PathBuf::from("/sys/bus/pci/drivers_probe"), address)?;

    info!(address = %address, "device bound to vfio-pci");
    Ok(())
}
