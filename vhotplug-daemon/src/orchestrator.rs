//! Orchestrator: the single serialized command loop.
//!
//! Kernel events and API requests converge here. The orchestrator is the
//! sole mutator of the attachment registry and the sole caller into
//! hypervisor adapters; every adapter call is awaited before the next
//! command is taken, so per-device and per-VM ordering fall out of the loop
//! itself. Notifications are published after the corresponding registry
//! transition has committed.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use vhotplug_core::adapters::VmAdapter;
use vhotplug_core::protocol::{
    Notification, PciDeviceJson, PciSelector, UsbDeviceJson, UsbSelector,
};
use vhotplug_core::{
    AttachmentRegistry, Config, DeviceEvent, DeviceKey, DeviceSource, Error, EvdevDevice,
    EventAction, HostDevice, PciDevice, Result, RuleEngine, UsbDevice, Verdict,
};

/// Data carried by a successful API reply.
#[derive(Debug)]
pub enum ApiData {
    None,
    UsbDevices(Vec<UsbDeviceJson>),
    PciDevices(Vec<PciDeviceJson>),
}

pub type ApiReply = Result<ApiData>;

/// An API operation routed into the command loop.
#[derive(Debug)]
pub enum ApiCommand {
    UsbList,
    UsbAttach { selector: UsbSelector, vm: String },
    UsbDetach { selector: UsbSelector },
    PciList,
    PciAttach { selector: PciSelector, vm: String },
    PciDetach { selector: PciSelector },
}

/// One queued API request with its reply channel.
#[derive(Debug)]
pub struct ApiRequest {
    pub command: ApiCommand,
    pub reply: oneshot::Sender<ApiReply>,
}

pub struct Orchestrator {
    config: Config,
    engine: RuleEngine,
    usb: HashMap<DeviceKey, UsbDevice>,
    pci: HashMap<String, PciDevice>,
    registry: AttachmentRegistry,
    adapters: HashMap<String, Arc<dyn VmAdapter>>,
    notifications: broadcast::Sender<Notification>,
    /// Next guest pcie port for evdev placement.
    evdev_slot: u32,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        adapters: HashMap<String, Arc<dyn VmAdapter>>,
        notifications: broadcast::Sender<Notification>,
    ) -> Result<Self> {
        let engine = RuleEngine::new(&config)?;
        Ok(Self {
            config,
            engine,
            usb: HashMap::new(),
            pci: HashMap::new(),
            registry: AttachmentRegistry::new(),
            adapters,
            notifications,
            evdev_slot: 1,
        })
    }

    /// Run until shutdown is signalled or the device source is lost.
    pub async fn run(
        mut self,
        mut source: DeviceSource,
        mut api: mpsc::Receiver<ApiRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut api_open = true;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.shutdown().await;
                    return Ok(());
                }
                event = source.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        return Err(Error::SourceLost {
                            reason: "device monitor terminated".to_string(),
                        });
                    }
                },
                request = api.recv(), if api_open => match request {
                    Some(request) => {
                        let reply = self.handle_command(request.command).await;
                        let _ = request.reply.send(reply);
                    }
                    None => api_open = false,
                },
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("shutting down adapters");
        for adapter in self.adapters.values() {
            adapter.shutdown().await;
        }
    }

    fn publish(&self, notification: Notification) {
        debug!(event = notification.event(), "publishing notification");
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn adapter(&self, vm: &str) -> Result<Arc<dyn VmAdapter>> {
        self.adapters
            .get(vm)
            .cloned()
            .ok_or_else(|| Error::UnknownVm { vm: vm.to_string() })
    }

    pub async fn handle_event(&mut self, event: DeviceEvent) {
        match (event.action, event.device) {
            (EventAction::Add, HostDevice::Usb(dev)) => self.usb_added(dev).await,
            (EventAction::Remove, HostDevice::Usb(dev)) => self.usb_removed(dev).await,
            (EventAction::Change, HostDevice::Usb(dev)) => {
                self.usb.insert(dev.key(), dev);
            }
            (EventAction::Add, HostDevice::Pci(dev)) => self.pci_added(dev).await,
            (EventAction::Remove, HostDevice::Pci(dev)) => self.pci_removed(dev).await,
            (EventAction::Change, HostDevice::Pci(dev)) => {
                self.pci.insert(dev.address.clone(), dev);
            }
            (EventAction::Add, HostDevice::Input(dev)) => self.evdev_added(dev).await,
            (EventAction::Remove, HostDevice::Input(dev)) => self.evdev_removed(dev),
            (EventAction::Change, HostDevice::Input(_)) => {}
        }
    }

    async fn usb_added(&mut self, dev: UsbDevice) {
        let key = dev.key();
        info!("USB device {} connected: {}", dev.friendly_name(), dev.device_node());
        self.usb.insert(key.clone(), dev.clone());
        self.publish(Notification::UsbConnected(UsbDeviceJson::new(&dev)));

        if dev.is_hub() {
            debug!("{} is a hub, not a passthrough candidate", dev.friendly_name());
            return;
        }
        if self.registry.vm_for(&key).is_some() {
            // Replay of a device we already own (e.g. startup enumeration
            // racing the live monitor).
            return;
        }

        let eligible = self.engine.eligible_usb(&dev);
        if eligible.len() > 1 {
            info!(
                "multiple VMs {:?} eligible for {}, awaiting selection",
                eligible,
                dev.friendly_name()
            );
            self.publish(Notification::UsbSelectVm {
                device: UsbDeviceJson::new(&dev),
                allowed_vms: eligible,
            });
            return;
        }

        match self.engine.evaluate_usb(&dev) {
            Verdict::Allow(vm) => {
                if let Err(e) = self.attach_usb_to_vm(&dev, &vm).await {
                    // The next relevant udev event is the retry trigger.
                    warn!("failed to attach {}: {}", dev.friendly_name(), e);
                }
            }
            Verdict::Deny => debug!("{} denied by rules", dev.friendly_name()),
            Verdict::Disable => debug!("{} disabled by rules", dev.friendly_name()),
            Verdict::NoMatch => debug!("no rule matches {}", dev.friendly_name()),
        }
    }

    async fn usb_removed(&mut self, dev: UsbDevice) {
        let key = dev.key();
        // Prefer the stored record: remove events carry fewer attributes.
        let dev = self.usb.remove(&key).unwrap_or(dev);
        info!("USB device disconnected: {}", dev.device_node());

        if let Some(vm) = self.registry.vm_for(&key).map(str::to_string) {
            // The device is gone from the host either way, so a failed
            // detach must not keep the stale binding alive.
            match self.adapter(&vm) {
                Ok(adapter) => {
                    if let Err(e) = adapter.detach_usb(&dev).await {
                        warn!("detach of {} from {} failed: {}", dev.friendly_name(), vm, e);
                    }
                }
                Err(e) => warn!("{}", e),
            }
            let _ = self.registry.remove(&key);
            self.publish(Notification::UsbDetached { device: UsbDeviceJson::new(&dev), vm });
        }
        self.publish(Notification::UsbDisconnected(UsbDeviceJson::new(&dev)));
    }

    /// Attach a USB device, enforcing the single-owner invariant.
    async fn attach_usb_to_vm(&mut self, dev: &UsbDevice, vm: &str) -> Result<()> {
        let key = dev.key();
        match self.registry.vm_for(&key) {
            Some(owner) if owner == vm => {
                debug!("{} already attached to {}", dev.friendly_name(), vm);
                return Ok(());
            }
            Some(owner) => return Err(Error::AlreadyAttached { vm: owner.to_string() }),
            None => {}
        }

        let adapter = self.adapter(vm)?;
        adapter.attach_usb(dev).await?;
        self.registry.insert(key, vm)?;
        info!("attached {} to {}", dev.friendly_name(), vm);
        self.publish(Notification::UsbAttached {
            device: UsbDeviceJson::new(dev),
            vm: vm.to_string(),
        });
        Ok(())
    }

    async fn pci_added(&mut self, dev: PciDevice) {
        let key = dev.key();
        info!("PCI device {} present at {}", dev.friendly_name(), dev.address);
        self.pci.insert(dev.address.clone(), dev.clone());

        if self.registry.vm_for(&key).is_some() {
            return;
        }

        let eligible = self.engine.eligible_pci(&dev);
        if eligible.len() > 1 {
            // Interactive selection exists only for USB; fall back to the
            // documented first-match tie-break.
            warn!(
                "multiple VMs {:?} eligible for PCI {}, using first match",
                eligible,
                dev.address
            );
        }

        match self.engine.evaluate_pci(&dev) {
            Verdict::Allow(vm) => {
                if let Err(e) = self.attach_pci_to_vm(&dev, &vm).await {
                    warn!("failed to attach PCI {}: {}", dev.address, e);
                }
            }
            Verdict::Deny => debug!("PCI {} denied by rules", dev.address),
            Verdict::Disable => debug!("PCI {} disabled by rules", dev.address),
            Verdict::NoMatch => debug!("no rule matches PCI {}", dev.address),
        }
    }

    async fn pci_removed(&mut self, dev: PciDevice) {
        let key = dev.key();
        let dev = self.pci.remove(&dev.address).unwrap_or(dev);
        info!("PCI device removed: {}", dev.address);

        if let Some(vm) = self.registry.vm_for(&key).map(str::to_string) {
            match self.adapter(&vm) {
                Ok(adapter) => {
                    if let Err(e) = adapter.detach_pci(&dev).await {
                        warn!("detach of PCI {} from {} failed: {}", dev.address, vm, e);
                    }
                }
                Err(e) => warn!("{}", e),
            }
            let _ = self.registry.remove(&key);
            self.publish(Notification::PciDetached { device: PciDeviceJson::new(&dev), vm });
        }
    }

    async fn attach_pci_to_vm(&mut self, dev: &PciDevice, vm: &str) -> Result<()> {
        let key = dev.key();
        match self.registry.vm_for(&key) {
            Some(owner) if owner == vm => return Ok(()),
            Some(owner) => return Err(Error::AlreadyAttached { vm: owner.to_string() }),
            None => {}
        }

        let adapter = self.adapter(vm)?;
        if adapter.capabilities().pci && dev.driver.as_deref() != Some("vfio-pci") {
            pci_bind_vfio(dev)?;
        }
        adapter.attach_pci(dev).await?;
        self.registry.insert(key, vm)?;
        info!("attached PCI {} to {}", dev.address, vm);
        self.publish(Notification::PciAttached {
            device: PciDeviceJson::new(dev),
            vm: vm.to_string(),
        });
        Ok(())
    }

    async fn evdev_added(&mut self, dev: EvdevDevice) {
        let Some(evdev) = self.config.evdev().cloned() else {
            return;
        };
        let key = dev.key();
        if self.registry.vm_for(&key).is_some() {
            return;
        }
        info!("input device found: {}", dev.friendly_name());

        let adapter = match self.adapter(&evdev.target_vm) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("{}", e);
                return;
            }
        };
        let bus = format!(
            "{}{}",
            evdev.pcie_bus_prefix.as_deref().unwrap_or_default(),
            self.evdev_slot
        );
        match adapter.attach_evdev(&dev, &bus).await {
            Ok(()) => {
                self.evdev_slot += 1;
                let _ = self.registry.insert(key, &evdev.target_vm);
                info!("attached {} to {} on bus {}", dev.friendly_name(), evdev.target_vm, bus);
            }
            Err(e) => warn!("failed to attach {}: {}", dev.friendly_name(), e),
        }
    }

    fn evdev_removed(&mut self, dev: EvdevDevice) {
        // The guest-side virtio-input device dies with the host node; there
        // is no detach verb in the adapter capability set.
        if self.registry.remove(&dev.key()).is_ok() {
            info!("input device removed: {}", dev.friendly_name());
        }
    }

    pub async fn handle_command(&mut self, command: ApiCommand) -> ApiReply {
        match command {
            ApiCommand::UsbList => Ok(ApiData::UsbDevices(self.usb_list())),
            ApiCommand::PciList => Ok(ApiData::PciDevices(self.pci_list())),
            ApiCommand::UsbAttach { selector, vm } => {
                if self.config.vm(&vm).is_none() {
                    return Err(Error::UnknownVm { vm });
                }
                let dev = self.resolve_usb(&selector)?.clone();
                // Operator intent is authoritative: no rule evaluation here.
                self.attach_usb_to_vm(&dev, &vm).await?;
                Ok(ApiData::None)
            }
            ApiCommand::UsbDetach { selector } => {
                let dev = self.resolve_usb(&selector)?.clone();
                let key = dev.key();
                let vm = self
                    .registry
                    .vm_for(&key)
                    .map(str::to_string)
                    .ok_or(Error::NotAttached)?;
                self.adapter(&vm)?.detach_usb(&dev).await?;
                self.registry.remove(&key)?;
                info!("detached {} from {}", dev.friendly_name(), vm);
                self.publish(Notification::UsbDetached { device: UsbDeviceJson::new(&dev), vm });
                Ok(ApiData::None)
            }
            ApiCommand::PciAttach { selector, vm } => {
                if self.config.vm(&vm).is_none() {
                    return Err(Error::UnknownVm { vm });
                }
                let dev = self.resolve_pci(&selector)?.clone();
                self.attach_pci_to_vm(&dev, &vm).await?;
                Ok(ApiData::None)
            }
            ApiCommand::PciDetach { selector } => {
                let dev = self.resolve_pci(&selector)?.clone();
                let key = dev.key();
                let vm = self
                    .registry
                    .vm_for(&key)
                    .map(str::to_string)
                    .ok_or(Error::NotAttached)?;
                self.adapter(&vm)?.detach_pci(&dev).await?;
                self.registry.remove(&key)?;
                info!("detached PCI {} from {}", dev.address, vm);
                self.publish(Notification::PciDetached { device: PciDeviceJson::new(&dev), vm });
                Ok(ApiData::None)
            }
        }
    }

    fn resolve_usb(&self, selector: &UsbSelector) -> Result<&UsbDevice> {
        let matches: Vec<&UsbDevice> = self
            .usb
            .values()
            .filter(|dev| match selector {
                UsbSelector::Node(node) => dev.device_node() == *node,
                UsbSelector::BusPort { bus, port } => dev.bus == *bus && dev.port == *port,
                UsbSelector::VidPid { vid, pid } => dev.vid == *vid && dev.pid == *pid,
            })
            .collect();
        match matches.len() {
            0 => Err(Error::NoSuchDevice { selector: selector.to_string() }),
            1 => Ok(matches[0]),
            count => Err(Error::Ambiguous { selector: selector.to_string(), count }),
        }
    }

    fn resolve_pci(&self, selector: &PciSelector) -> Result<&PciDevice> {
        let matches: Vec<&PciDevice> = self
            .pci
            .values()
            .filter(|dev| match selector {
                PciSelector::Address(address) => dev.address.eq_ignore_ascii_case(address),
                PciSelector::VidDid { vid, did } => dev.vid == *vid && dev.did == *did,
            })
            .collect();
        match matches.len() {
            0 => Err(Error::NoSuchDevice { selector: selector.to_string() }),
            1 => Ok(matches[0]),
            count => Err(Error::Ambiguous { selector: selector.to_string(), count }),
        }
    }

    fn usb_list(&self) -> Vec<UsbDeviceJson> {
        let mut devices: Vec<&UsbDevice> =
            self.usb.values().filter(|dev| !dev.is_hub()).collect();
        devices.sort_by_key(|dev| (dev.bus, dev.address));
        devices
            .into_iter()
            .map(|dev| {
                let vm = self.registry.vm_for(&dev.key()).map(str::to_string);
                UsbDeviceJson::new(dev).with_vms(self.engine.eligible_usb(dev), vm)
            })
            .collect()
    }

    fn pci_list(&self) -> Vec<PciDeviceJson> {
        let mut devices: Vec<&PciDevice> = self.pci.values().collect();
        devices.sort_by(|a, b| a.address.cmp(&b.address));
        devices
            .into_iter()
            .map(|dev| {
                let vm = self.registry.vm_for(&dev.key()).map(str::to_string);
                PciDeviceJson::new(dev).with_vms(self.engine.eligible_pci(dev), vm)
            })
            .collect()
    }
}

/// Rebind a PCI device to vfio-pci before handing it to the hypervisor.
fn pci_bind_vfio(dev: &PciDevice) -> Result<()> {
    info!(
        "binding PCI {} to vfio-pci (current driver: {})",
        dev.address,
        dev.driver.as_deref().unwrap_or("none")
    );
    vhotplug_core::vfio::bind_vfio(&dev.address)
}

#[cfg(test)]
mod tests;
