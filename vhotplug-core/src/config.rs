//! Configuration file schema and load-time validation.
//!
//! The config is a UTF-8 JSON file. Unknown top-level fields are ignored so
//! newer configs keep working on older daemons; unknown fields inside rules
//! are rejected because a typoed predicate would silently widen a rule.
//! Regex predicates are compiled here so a malformed pattern is a startup
//! error, never a match-time surprise.

use crate::error::{Error, Result};
use crate::rules::RuleEngine;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub usb_passthrough: Vec<RuleSetConfig>,
    #[serde(default)]
    pub pci_passthrough: Vec<RuleSetConfig>,
    pub evdev_passthrough: Option<EvdevConfig>,
    #[serde(default)]
    pub vms: Vec<VmSpec>,
    #[serde(default)]
    pub general: GeneralConfig,
}

/// An ordered group of allow/deny rules addressed at one target VM.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetConfig {
    pub target_vm: String,
    #[serde(default)]
    pub allow: Vec<RuleConfig>,
    #[serde(default)]
    pub deny: Vec<RuleConfig>,
    pub description: Option<String>,
}

/// One rule: an unordered set of predicates, all of which must hold.
///
/// Absent predicates are wildcards. USB-only and PCI-only predicates share
/// one schema; a predicate the device kind does not carry simply never
/// matches.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleConfig {
    // Shared literal predicates (case-insensitive equality)
    pub vid: Option<String>,
    pub pid: Option<String>,
    pub did: Option<String>,
    pub address: Option<String>,

    // Anchored, case-insensitive regular expressions
    pub vendor_name: Option<String>,
    pub product_name: Option<String>,

    // USB topology
    pub bus: Option<u8>,
    pub port: Option<String>,

    // Device-level class triplet (USB bDevice*, PCI class code)
    pub device_class: Option<u8>,
    pub device_subclass: Option<u8>,
    pub device_protocol: Option<u8>,
    pub device_prog_if: Option<u8>,

    // USB interface class triplet; matches if any interface satisfies all
    pub interface_class: Option<u8>,
    pub interface_subclass: Option<u8>,
    pub interface_protocol: Option<u8>,

    #[serde(default)]
    pub disable: bool,
    pub description: Option<String>,
}

/// Evdev passthrough target.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvdevConfig {
    pub target_vm: String,
    /// Prefix of the guest pcie root ports evdev devices are placed on;
    /// slot N becomes bus `<prefix><N>`.
    pub pcie_bus_prefix: Option<String>,
    #[serde(default)]
    pub disable: bool,
}

impl EvdevConfig {
    pub fn enabled(&self) -> bool {
        !self.disable
    }
}

/// One managed virtual machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub vm_type: VmType,
    pub socket: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Qemu,
    Crosvm,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralConfig {
    pub api: Option<ApiConfig>,
    /// Path to the crosvm binary used to drive crosvm control sockets.
    pub crosvm: Option<String>,
}

/// API server configuration under `general.api`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u32,
    #[serde(default = "default_unix_socket")]
    pub unix_socket: PathBuf,
    #[serde(default)]
    pub transports: Vec<Transport>,
    /// When set, VSOCK connections from other CIDs are rejected.
    pub allowed_cids: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Vsock,
    Unix,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u32 {
    2000
}

fn default_unix_socket() -> PathBuf {
    PathBuf::from("/run/vhotplug/vhotplug.sock")
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::ConfigInvalid {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| Error::ConfigInvalid { reason: format!("failed to parse config: {}", e) })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        // Regex predicates must compile; RuleEngine::new reports the
        // offending pattern.
        RuleEngine::new(self)?;

        for rule_set in self.usb_passthrough.iter().chain(&self.pci_passthrough) {
            if self.vm(&rule_set.target_vm).is_none() {
                return Err(Error::ConfigInvalid {
                    reason: format!(
                        "rule set \"{}\" targets undefined VM {}",
                        rule_set.description.as_deref().unwrap_or("unnamed"),
                        rule_set.target_vm
                    ),
                });
            }
        }

        if let Some(evdev) = &self.evdev_passthrough {
            if evdev.enabled() {
                let vm = self.vm(&evdev.target_vm).ok_or_else(|| Error::ConfigInvalid {
                    reason: format!("evdevPassthrough targets undefined VM {}", evdev.target_vm),
                })?;
                if vm.vm_type != VmType::Qemu {
                    return Err(Error::ConfigInvalid {
                        reason: format!(
                            "evdevPassthrough requires a qemu VM, {} is {:?}",
                            vm.name, vm.vm_type
                        ),
                    });
                }
                if evdev.pcie_bus_prefix.is_none() {
                    return Err(Error::ConfigInvalid {
                        reason: "evdevPassthrough requires pcieBusPrefix".to_string(),
                    });
                }
            }
        }

        let mut names: Vec<&str> = self.vms.iter().map(|vm| vm.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.vms.len() {
            return Err(Error::ConfigInvalid { reason: "duplicate VM names".to_string() });
        }

        Ok(())
    }

    /// Look up a VM by name.
    pub fn vm(&self, name: &str) -> Option<&VmSpec> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    /// Evdev passthrough config, if present and enabled.
    pub fn evdev(&self) -> Option<&EvdevConfig> {
        self.evdev_passthrough.as_ref().filter(|evdev| evdev.enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "usbPassthrough": [
            {
                "targetVm": "vm1",
                "allow": [
                    {"interfaceClass": 3, "interfaceProtocol": 2, "description": "mice"}
                ],
                "deny": [
                    {"vid": "046d", "pid": "c52b"}
                ],
                "description": "input devices"
            }
        ],
        "pciPassthrough": [
            {
                "targetVm": "vm2",
                "allow": [{"address": "0000:01:00.0"}]
            }
        ],
        "evdevPassthrough": {"targetVm": "vm1", "pcieBusPrefix": "rp"},
        "vms": [
            {"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"},
            {"name": "vm2", "type": "qemu", "socket": "/run/vm2.sock"}
        ],
        "general": {
            "api": {"transports": ["tcp", "unix"], "port": 2100}
        },
        "futureTopLevelField": 42
    }"#;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(CONFIG).unwrap();
        assert_eq!(config.usb_passthrough.len(), 1);
        assert_eq!(config.usb_passthrough[0].target_vm, "vm1");
        assert_eq!(config.usb_passthrough[0].deny.len(), 1);
        assert_eq!(config.vms.len(), 2);
        let api = config.general.api.unwrap();
        assert!(api.enable);
        assert_eq!(api.port, 2100);
        assert_eq!(api.host, "127.0.0.1");
        assert_eq!(api.transports, vec![Transport::Tcp, Transport::Unix]);
    }

    #[test]
    fn unknown_top_level_fields_are_ignored() {
        // CONFIG carries futureTopLevelField; parse must succeed.
        assert!(Config::parse(CONFIG).is_ok());
    }

    #[test]
    fn unknown_rule_fields_are_rejected() {
        let config = r#"{
            "usbPassthrough": [
                {"targetVm": "vm1", "allow": [{"vendorid": "046d"}]}
            ],
            "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
        }"#;
        let err = Config::parse(config).unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }

    #[test]
    fn malformed_regex_is_a_load_error() {
        let config = r#"{
            "usbPassthrough": [
                {"targetVm": "vm1", "allow": [{"productName": "(unclosed"}]}
            ],
            "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
        }"#;
        let err = Config::parse(config).unwrap_err();
        assert_eq!(err.code(), "config_invalid");
    }

    #[test]
    fn undefined_target_vm_is_rejected() {
        let config = r#"{
            "usbPassthrough": [{"targetVm": "ghost", "allow": [{"vid": "046d"}]}],
            "vms": []
        }"#;
        assert!(Config::parse(config).is_err());
    }

    #[test]
    fn evdev_requires_bus_prefix() {
        let config = r#"{
            "evdevPassthrough": {"targetVm": "vm1"},
            "vms": [{"name": "vm1", "type": "qemu", "socket": "/run/vm1.sock"}]
        }"#;
        assert!(Config::parse(config).is_err());
    }

    #[test]
    fn disabled_evdev_skips_validation() {
        let config = r#"{
            "evdevPassthrough": {"targetVm": "ghost", "disable": true},
            "vms": []
        }"#;
        let config = Config::parse(config).unwrap();
        assert!(config.evdev().is_none());
    }

    #[test]
    fn crosvm_evdev_target_is_rejected() {
        let config = r#"{
            "evdevPassthrough": {"targetVm": "vm1", "pcieBusPrefix": "rp"},
            "vms": [{"name": "vm1", "type": "crosvm", "socket": "/run/vm1.sock"}]
        }"#;
        assert!(Config::parse(config).is_err());
    }
}
