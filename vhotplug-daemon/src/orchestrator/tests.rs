//! Orchestrator behavior tests with a mock hypervisor adapter.

use super::*;
use async_trait::async_trait;
use std::sync::Mutex;
use vhotplug_core::adapters::AdapterCapabilities;
use vhotplug_core::types::usb::parse_interfaces;
use vhotplug_core::types::UsbInterface;

/// Records adapter calls and fails on demand.
struct MockAdapter {
    vm: String,
    calls: Arc<Mutex<Vec<String>>>,
    fail_attach: bool,
    fail_detach: bool,
}

impl MockAdapter {
    fn new(vm: &str, calls: Arc<Mutex<Vec<String>>>) -> Self {
        Self { vm: vm.to_string(), calls, fail_attach: false, fail_detach: false }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn unreachable(&self) -> Error {
        Error::VmUnreachable { vm: self.vm.clone(), reason: "connection refused".into() }
    }
}

#[async_trait]
impl VmAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.vm
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities { usb: true, pci: true, evdev: true }
    }

    async fn attach_usb(&self, dev: &UsbDevice) -> Result<()> {
        self.record(format!("attach_usb {} {}", self.vm, dev.device_node()));
        if self.fail_attach {
            return Err(self.unreachable());
        }
        Ok(())
    }

    async fn detach_usb(&self, dev: &UsbDevice) -> Result<()> {
        self.record(format!("detach_usb {} {}", self.vm, dev.device_node()));
        if self.fail_detach {
            return Err(self.unreachable());
        }
        Ok(())
    }

    async fn attach_pci(&self, dev: &PciDevice) -> Result<()> {
        self.record(format!("attach_pci {} {}", self.vm, dev.address));
        if self.fail_attach {
            return Err(self.unreachable());
        }
        Ok(())
    }

    async fn detach_pci(&self, dev: &PciDevice) -> Result<()> {
        self.record(format!("detach_pci {} {}", self.vm, dev.address));
        Ok(())
    }

    async fn attach_evdev(&self, dev: &EvdevDevice, bus: &str) -> Result<()> {
        self.record(format!("attach_evdev {} {} {}", self.vm, dev.node, bus));
        Ok(())
    }

    async fn shutdown(&self) {
        self.record(format!("shutdown {}", self.vm));
    }
}

struct Harness {
    orchestrator: Orchestrator,
    notifications: broadcast::Receiver<Notification>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    fn new(config_json: &str) -> Self {
        Self::build(config_json, false, false)
    }

    fn build(config_json: &str, fail_attach: bool, fail_detach: bool) -> Self {
        let config = Config::parse(config_json).unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut adapters: HashMap<String, Arc<dyn VmAdapter>> = HashMap::new();
        for vm in &config.vms {
            let mut adapter = MockAdapter::new(&vm.name, calls.clone());
            adapter.fail_attach = fail_attach;
            adapter.fail_detach = fail_detach;
            adapters.insert(vm.name.clone(), Arc::new(adapter));
        }
        let (tx, rx) = broadcast::channel(64);
        let orchestrator = Orchestrator::new(config, adapters, tx).unwrap();
        Self { orchestrator, notifications: rx, calls }
    }

    async fn add_usb(&mut self, dev: &UsbDevice) {
        self.orchestrator
            .handle_event(DeviceEvent {
                action: EventAction::Add,
                device: HostDevice::Usb(dev.clone()),
            })
            .await;
    }

    async fn remove_usb(&mut self, dev: &UsbDevice) {
        self.orchestrator
            .handle_event(DeviceEvent {
                action: EventAction::Remove,
                device: HostDevice::Usb(dev.clone()),
            })
            .await;
    }

    fn events(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            events.push(notification.event().to_string());
        }
        events
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

fn usb(bus: u8, address: u8, vid: &str, pid: &str, interfaces: &str) -> UsbDevice {
    UsbDevice {
        bus,
        address,
        port: format!("{}", address),
        vid: vid.into(),
        pid: pid.into(),
        vendor_name: Some("Logitech".into()),
        product_name: Some("USB Receiver".into()),
        device_class: 0,
        device_subclass: 0,
        device_protocol: 0,
        interfaces: parse_interfaces(interfaces),
    }
}

const HID_CONFIG: &str = r#"{
    "usbPassthrough": [
        {
            "targetVm": "vm1",
            "allow": [{"interfaceClass": 3, "interfaceProtocol": 2}],
            "deny": [{"vid": "046d", "pid": "c52b"}]
        }
    ],
    "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
}"#;

#[tokio::test]
async fn hid_device_is_attached_with_ordered_notifications() {
    let mut harness = Harness::new(HID_CONFIG);
    let dev = usb(1, 4, "046d", "c077", ":030102:");

    harness.add_usb(&dev).await;

    assert_eq!(harness.calls(), vec!["attach_usb vm1 /dev/bus/usb/001/004"]);
    assert_eq!(harness.events(), vec!["usb_connected", "usb_attached"]);
    assert_eq!(
        harness.orchestrator.registry.vm_for(&dev.key()),
        Some("vm1")
    );
}

#[tokio::test]
async fn denied_device_only_announces_connection() {
    let mut harness = Harness::new(HID_CONFIG);
    let dev = usb(1, 4, "046d", "c52b", ":030102:");

    harness.add_usb(&dev).await;

    assert!(harness.calls().is_empty());
    assert_eq!(harness.events(), vec!["usb_connected"]);
    assert!(harness.orchestrator.registry.is_empty());
}

#[tokio::test]
async fn disabled_rule_attaches_nothing_and_asks_nothing() {
    let mut harness = Harness::new(
        r#"{
        "usbPassthrough": [
            {"targetVm": "vm1", "allow": [{"vid": "067b", "pid": "23a3", "disable": true}]}
        ],
        "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
    }"#,
    );
    let dev = usb(1, 4, "067b", "23a3", ":ff0000:");

    harness.add_usb(&dev).await;

    assert!(harness.calls().is_empty());
    assert_eq!(harness.events(), vec!["usb_connected"]);
}

#[tokio::test]
async fn failed_attach_is_logged_not_registered() {
    let mut harness = Harness::build(HID_CONFIG, true, false);
    let dev = usb(1, 4, "046d", "c077", ":030102:");

    harness.add_usb(&dev).await;

    // The adapter was asked, but no binding and no usb_attached exist.
    assert_eq!(harness.calls().len(), 1);
    assert_eq!(harness.events(), vec!["usb_connected"]);
    assert!(harness.orchestrator.registry.is_empty());
}

#[tokio::test]
async fn unplug_detaches_and_clears_binding() {
    let mut harness = Harness::new(HID_CONFIG);
    let dev = usb(1, 4, "046d", "c077", ":030102:");

    harness.add_usb(&dev).await;
    harness.events();
    harness.remove_usb(&dev).await;

    assert_eq!(
        harness.calls(),
        vec![
            "attach_usb vm1 /dev/bus/usb/001/004",
            "detach_usb vm1 /dev/bus/usb/001/004",
        ]
    );
    assert_eq!(harness.events(), vec!["usb_detached", "usb_disconnected"]);
    assert!(harness.orchestrator.registry.is_empty());
}

#[tokio::test]
async fn unplug_survives_unreachable_vm() {
    let mut harness = Harness::build(HID_CONFIG, false, true);
    let dev = usb(1, 4, "046d", "c077", ":030102:");

    harness.add_usb(&dev).await;
    harness.events();
    harness.remove_usb(&dev).await;

    // Detach failed, but the device is gone: the binding is cleared and
    // both notifications are still emitted.
    assert_eq!(harness.events(), vec!["usb_detached", "usb_disconnected"]);
    assert!(harness.orchestrator.registry.is_empty());
}

#[tokio::test]
async fn hub_is_never_attached() {
    let mut harness = Harness::new(
        r#"{
        "usbPassthrough": [
            {"targetVm": "vm1", "allow": [{"interfaceClass": 9}]}
        ],
        "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
    }"#,
    );
    let dev = usb(1, 1, "1d6b", "0002", ":090000:");

    harness.add_usb(&dev).await;

    assert!(harness.calls().is_empty());
    assert_eq!(harness.events(), vec!["usb_connected"]);
}

const TWO_VM_CONFIG: &str = r#"{
    "usbPassthrough": [
        {"targetVm": "vm1", "allow": [{"interfaceClass": 1}]},
        {"targetVm": "vm2", "allow": [{"interfaceClass": 1}]}
    ],
    "vms": [
        {"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"},
        {"name": "vm2", "type": "qemu", "socket": "/run/vm2.sock"}
    ]
}"#;

#[tokio::test]
async fn multiple_eligible_vms_defer_to_selection() {
    let mut harness = Harness::new(TWO_VM_CONFIG);
    let dev = usb(1, 4, "1234", "5678", ":010100:");

    harness.add_usb(&dev).await;

    assert!(harness.calls().is_empty());
    assert_eq!(harness.events(), vec!["usb_connected", "usb_select_vm"]);
    assert!(harness.orchestrator.registry.is_empty());

    // The operator resolves the ambiguity towards vm2.
    let reply = harness
        .orchestrator
        .handle_command(ApiCommand::UsbAttach {
            selector: UsbSelector::VidPid { vid: "1234".into(), pid: "5678".into() },
            vm: "vm2".into(),
        })
        .await;
    assert!(reply.is_ok());
    assert_eq!(harness.calls(), vec!["attach_usb vm2 /dev/bus/usb/001/004"]);
    assert_eq!(harness.events(), vec!["usb_attached"]);
    assert_eq!(harness.orchestrator.registry.vm_for(&dev.key()), Some("vm2"));
}

#[tokio::test]
async fn ambiguous_selector_is_rejected() {
    let mut harness = Harness::new(TWO_VM_CONFIG);
    harness.add_usb(&usb(1, 4, "1111", "2222", ":ff0000:")).await;
    harness.add_usb(&usb(1, 5, "1111", "2222", ":ff0000:")).await;

    let reply = harness
        .orchestrator
        .handle_command(ApiCommand::UsbAttach {
            selector: UsbSelector::VidPid { vid: "1111".into(), pid: "2222".into() },
            vm: "vm1".into(),
        })
        .await;
    let err = reply.unwrap_err();
    assert_eq!(err.code(), "ambiguous");
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn api_attach_bypasses_rules_but_respects_ownership() {
    let mut harness = Harness::new(TWO_VM_CONFIG);
    // No rule matches this device; the operator attaches it anyway.
    let dev = usb(2, 9, "dead", "beef", ":ff0000:");
    harness.add_usb(&dev).await;

    let reply = harness
        .orchestrator
        .handle_command(ApiCommand::UsbAttach {
            selector: UsbSelector::Node("/dev/bus/usb/002/009".into()),
            vm: "vm1".into(),
        })
        .await;
    assert!(reply.is_ok());

    // A second attach to another VM must fail: single-owner invariant.
    let err = harness
        .orchestrator
        .handle_command(ApiCommand::UsbAttach {
            selector: UsbSelector::Node("/dev/bus/usb/002/009".into()),
            vm: "vm2".into(),
        })
        .await
        .unwrap_err();
    match err {
        Error::AlreadyAttached { vm } => assert_eq!(vm, "vm1"),
        other => panic!("expected AlreadyAttached, got {:?}", other),
    }
    assert_eq!(harness.orchestrator.registry.vm_for(&dev.key()), Some("vm1"));
}

#[tokio::test]
async fn api_attach_to_unknown_vm_fails() {
    let mut harness = Harness::new(HID_CONFIG);
    harness.add_usb(&usb(1, 4, "046d", "c52b", ":030102:")).await;

    let err = harness
        .orchestrator
        .handle_command(ApiCommand::UsbAttach {
            selector: UsbSelector::Node("/dev/bus/usb/001/004".into()),
            vm: "ghost".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unknown_vm");
}

#[tokio::test]
async fn api_detach_of_unattached_device_fails() {
    let mut harness = Harness::new(HID_CONFIG);
    harness.add_usb(&usb(1, 4, "046d", "c52b", ":030102:")).await;

    let err = harness
        .orchestrator
        .handle_command(ApiCommand::UsbDetach {
            selector: UsbSelector::Node("/dev/bus/usb/001/004".into()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotAttached));
}

#[tokio::test]
async fn missing_device_selector_fails() {
    let mut harness = Harness::new(HID_CONFIG);
    let err = harness
        .orchestrator
        .handle_command(ApiCommand::UsbAttach {
            selector: UsbSelector::VidPid { vid: "1111".into(), pid: "2222".into() },
            vm: "vm1".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "no_such_device");
}

#[tokio::test]
async fn usb_list_reports_vms_and_skips_hubs() {
    let mut harness = Harness::new(HID_CONFIG);
    let mouse = usb(1, 4, "046d", "c077", ":030102:");
    harness.add_usb(&mouse).await;
    harness.add_usb(&usb(1, 1, "1d6b", "0002", ":090000:")).await;

    let reply = harness.orchestrator.handle_command(ApiCommand::UsbList).await.unwrap();
    let ApiData::UsbDevices(devices) = reply else {
        panic!("expected usb device list");
    };
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_node, "/dev/bus/usb/001/004");
    assert_eq!(devices[0].allowed_vms.as_deref(), Some(&["vm1".to_string()][..]));
    assert_eq!(devices[0].vm.as_deref(), Some("vm1"));
}

fn pci(address: &str, vid: &str, did: &str) -> PciDevice {
    PciDevice {
        address: address.into(),
        vid: vid.into(),
        did: did.into(),
        device_class: 2,
        device_subclass: 0,
        device_prog_if: 0,
        description: Some("Ethernet controller".into()),
        // Already bound so tests never touch sysfs
        driver: Some("vfio-pci".into()),
    }
}

const PCI_CONFIG: &str = r#"{
    "pciPassthrough": [
        {"targetVm": "vm1", "allow": [{"vid": "8086", "did": "15f3"}]}
    ],
    "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
}"#;

#[tokio::test]
async fn matching_pci_device_is_attached_and_detached() {
    let mut harness = Harness::new(PCI_CONFIG);
    let dev = pci("0000:01:00.0", "8086", "15f3");

    harness
        .orchestrator
        .handle_event(DeviceEvent {
            action: EventAction::Add,
            device: HostDevice::Pci(dev.clone()),
        })
        .await;
    assert_eq!(harness.calls(), vec!["attach_pci vm1 0000:01:00.0"]);
    assert_eq!(harness.events(), vec!["pci_attached"]);

    harness
        .orchestrator
        .handle_event(DeviceEvent {
            action: EventAction::Remove,
            device: HostDevice::Pci(dev.clone()),
        })
        .await;
    assert_eq!(harness.events(), vec!["pci_detached"]);
    assert!(harness.orchestrator.registry.is_empty());
}

#[tokio::test]
async fn pci_detach_via_api() {
    let mut harness = Harness::new(PCI_CONFIG);
    let dev = pci("0000:01:00.0", "8086", "15f3");
    harness
        .orchestrator
        .handle_event(DeviceEvent {
            action: EventAction::Add,
            device: HostDevice::Pci(dev.clone()),
        })
        .await;
    harness.events();

    let reply = harness
        .orchestrator
        .handle_command(ApiCommand::PciDetach {
            selector: PciSelector::Address("0000:01:00.0".into()),
        })
        .await;
    assert!(reply.is_ok());
    assert_eq!(harness.events(), vec!["pci_detached"]);
    assert!(harness.orchestrator.registry.is_empty());
}

#[tokio::test]
async fn evdev_devices_land_on_sequential_bus_slots() {
    let mut harness = Harness::new(
        r#"{
        "evdevPassthrough": {"targetVm": "vm1", "pcieBusPrefix": "rp"},
        "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
    }"#,
    );

    for n in 3..5 {
        harness
            .orchestrator
            .handle_event(DeviceEvent {
                action: EventAction::Add,
                device: HostDevice::Input(EvdevDevice {
                    node: format!("/dev/input/event{}", n),
                    name: Some("AT Translated Set 2 keyboard".into()),
                    phys: None,
                    unique: None,
                }),
            })
            .await;
    }

    assert_eq!(
        harness.calls(),
        vec![
            "attach_evdev vm1 /dev/input/event3 rp1",
            "attach_evdev vm1 /dev/input/event4 rp2",
        ]
    );
    assert_eq!(harness.orchestrator.registry.len(), 2);
}

#[tokio::test]
async fn evdev_is_ignored_when_disabled() {
    let mut harness = Harness::new(HID_CONFIG);
    harness
        .orchestrator
        .handle_event(DeviceEvent {
            action: EventAction::Add,
            device: HostDevice::Input(EvdevDevice {
                node: "/dev/input/event3".into(),
                name: None,
                phys: None,
                unique: None,
            }),
        })
        .await;
    assert!(harness.calls().is_empty());
}

#[tokio::test]
async fn change_event_replaces_the_record() {
    let mut harness = Harness::new(HID_CONFIG);
    let dev = usb(1, 4, "046d", "c52b", ":030102:");
    harness.add_usb(&dev).await;

    let mut changed = dev.clone();
    changed.interfaces = vec![UsbInterface { class: 8, subclass: 6, protocol: 0x50 }];
    harness
        .orchestrator
        .handle_event(DeviceEvent {
            action: EventAction::Change,
            device: HostDevice::Usb(changed.clone()),
        })
        .await;

    let stored = harness.orchestrator.usb.get(&dev.key()).unwrap();
    assert_eq!(stored.interfaces, changed.interfaces);
    // No attach side effects from a change event
    assert!(harness.calls().is_empty());
}
