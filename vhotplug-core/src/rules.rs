//! Rule engine: matches typed devices against ordered rule sets.
//!
//! A rule matches a device iff every predicate present on the rule is
//! satisfied. String name predicates are regular expressions, compiled once
//! at config load, matched case-insensitively against the full attribute
//! (patterns are wrapped in `^(?:…)$`, Rust `regex` flavor). Hex-id
//! predicates compare case-insensitively; numeric predicates are exact.

use crate::config::{Config, RuleConfig, RuleSetConfig};
use crate::error::{Error, Result};
use crate::types::{PciDevice, UsbDevice};
use regex::{Regex, RegexBuilder};

/// Outcome of evaluating a device against the configured rule sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// First matching rule set allows the device into this VM.
    Allow(String),
    /// A deny rule matched and no later rule set allowed the device.
    Deny,
    /// The first matching allow rule carries `disable: true`.
    Disable,
    /// No rule matched.
    NoMatch,
}

/// A compiled rule. Field layout mirrors [`RuleConfig`] with name patterns
/// lifted to compiled regexes and hex ids lowercased.
struct Rule {
    vid: Option<String>,
    pid: Option<String>,
    did: Option<String>,
    address: Option<String>,
    vendor_name: Option<Regex>,
    product_name: Option<Regex>,
    bus: Option<u8>,
    port: Option<String>,
    device_class: Option<u8>,
    device_subclass: Option<u8>,
    device_protocol: Option<u8>,
    device_prog_if: Option<u8>,
    interface_class: Option<u8>,
    interface_subclass: Option<u8>,
    interface_protocol: Option<u8>,
    disable: bool,
}

struct RuleSet {
    target_vm: String,
    allow: Vec<Rule>,
    deny: Vec<Rule>,
}

/// Compiled rule sets for both device kinds.
pub struct RuleEngine {
    usb: Vec<RuleSet>,
    pci: Vec<RuleSet>,
}

fn compile_regex(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(&format!("^(?:{})$", pattern))
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::ConfigInvalid { reason: format!("invalid pattern {:?}: {}", pattern, e) })
}

fn compile_rule(config: &RuleConfig) -> Result<Rule> {
    Ok(Rule {
        vid: config.vid.as_ref().map(|s| s.to_lowercase()),
        pid: config.pid.as_ref().map(|s| s.to_lowercase()),
        did: config.did.as_ref().map(|s| s.to_lowercase()),
        address: config.address.as_ref().map(|s| s.to_lowercase()),
        vendor_name: config.vendor_name.as_deref().map(compile_regex).transpose()?,
        product_name: config.product_name.as_deref().map(compile_regex).transpose()?,
        bus: config.bus,
        port: config.port.clone(),
        device_class: config.device_class,
        device_subclass: config.device_subclass,
        device_protocol: config.device_protocol,
        device_prog_if: config.device_prog_if,
        interface_class: config.interface_class,
        interface_subclass: config.interface_subclass,
        interface_protocol: config.interface_protocol,
        disable: config.disable,
    })
}

fn compile_rule_set(config: &RuleSetConfig) -> Result<RuleSet> {
    Ok(RuleSet {
        target_vm: config.target_vm.clone(),
        allow: config.allow.iter().map(compile_rule).collect::<Result<_>>()?,
        deny: config.deny.iter().map(compile_rule).collect::<Result<_>>()?,
    })
}

/// `Some(expected) == actual`, or predicate absent.
fn eq_opt<T: PartialEq>(expected: &Option<T>, actual: &T) -> bool {
    expected.as_ref().map(|e| e == actual).unwrap_or(true)
}

fn regex_opt(pattern: &Option<Regex>, actual: Option<&str>) -> bool {
    match pattern {
        None => true,
        Some(re) => actual.map(|s| re.is_match(s)).unwrap_or(false),
    }
}

impl Rule {
    fn matches_usb(&self, dev: &UsbDevice) -> bool {
        // PCI-only predicates can never be satisfied by a USB device.
        if self.did.is_some() || self.address.is_some() || self.device_prog_if.is_some() {
            return false;
        }
        eq_opt(&self.vid, &dev.vid)
            && eq_opt(&self.pid, &dev.pid)
            && regex_opt(&self.vendor_name, dev.vendor_name.as_deref())
            && regex_opt(&self.product_name, dev.product_name.as_deref())
            && eq_opt(&self.bus, &dev.bus)
            && eq_opt(&self.port, &dev.port)
            && eq_opt(&self.device_class, &dev.device_class)
            && eq_opt(&self.device_subclass, &dev.device_subclass)
            && eq_opt(&self.device_protocol, &dev.device_protocol)
            && self.matches_interfaces(dev)
    }

    /// The interface triplet matches if any single interface satisfies all
    /// present constraints jointly.
    fn matches_interfaces(&self, dev: &UsbDevice) -> bool {
        if self.interface_class.is_none()
            && self.interface_subclass.is_none()
            && self.interface_protocol.is_none()
        {
            return true;
        }
        dev.interfaces.iter().any(|interface| {
            eq_opt(&self.interface_class, &interface.class)
                && eq_opt(&self.interface_subclass, &interface.subclass)
                && eq_opt(&self.interface_protocol, &interface.protocol)
        })
    }

    fn matches_pci(&self, dev: &PciDevice) -> bool {
        // USB-only predicates can never be satisfied by a PCI device.
        if self.pid.is_some()
            || self.bus.is_some()
            || self.port.is_some()
            || self.device_protocol.is_some()
            || self.interface_class.is_some()
            || self.interface_subclass.is_some()
            || self.interface_protocol.is_some()
            || self.vendor_name.is_some()
            || self.product_name.is_some()
        {
            return false;
        }
        eq_opt(&self.vid, &dev.vid)
            && eq_opt(&self.did, &dev.did)
            && eq_opt(&self.address, &dev.address.to_lowercase())
            && eq_opt(&self.device_class, &dev.device_class)
            && eq_opt(&self.device_subclass, &dev.device_subclass)
            && eq_opt(&self.device_prog_if, &dev.device_prog_if)
    }
}

impl RuleSet {
    /// Verdict of this rule set alone: deny rules veto the whole set.
    fn verdict<M: Fn(&Rule) -> bool>(&self, matches: M) -> Verdict {
        if self.deny.iter().any(&matches) {
            return Verdict::Deny;
        }
        match self.allow.iter().find(|&rule| matches(rule)) {
            Some(rule) if rule.disable => Verdict::Disable,
            Some(_) => Verdict::Allow(self.target_vm.clone()),
            None => Verdict::NoMatch,
        }
    }
}

impl RuleEngine {
    /// Compile all rule sets. Fails on the first malformed regex.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            usb: config.usb_passthrough.iter().map(compile_rule_set).collect::<Result<_>>()?,
            pci: config.pci_passthrough.iter().map(compile_rule_set).collect::<Result<_>>()?,
        })
    }

    /// First-match verdict for a USB device, in rule set declaration order.
    ///
    /// A deny match is local to its rule set: it blocks that set's allow
    /// rules and evaluation moves on. When nothing allows the device the
    /// verdict distinguishes "denied somewhere" from "never matched".
    pub fn evaluate_usb(&self, dev: &UsbDevice) -> Verdict {
        Self::evaluate(&self.usb, |rule| rule.matches_usb(dev))
    }

    pub fn evaluate_pci(&self, dev: &PciDevice) -> Verdict {
        Self::evaluate(&self.pci, |rule| rule.matches_pci(dev))
    }

    /// Target VMs of every rule set that would allow the device.
    ///
    /// Used to detect the multiple-eligible-VMs case and to report
    /// `allowed_vms` in device listings.
    pub fn eligible_usb(&self, dev: &UsbDevice) -> Vec<String> {
        Self::eligible(&self.usb, |rule| rule.matches_usb(dev))
    }

    pub fn eligible_pci(&self, dev: &PciDevice) -> Vec<String> {
        Self::eligible(&self.pci, |rule| rule.matches_pci(dev))
    }

    fn evaluate<M: Fn(&Rule) -> bool + Copy>(sets: &[RuleSet], matches: M) -> Verdict {
        let mut denied = false;
        for set in sets {
            match set.verdict(matches) {
                Verdict::NoMatch => {}
                Verdict::Deny => denied = true,
                verdict => return verdict,
            }
        }
        if denied {
            Verdict::Deny
        } else {
            Verdict::NoMatch
        }
    }

    fn eligible<M: Fn(&Rule) -> bool + Copy>(sets: &[RuleSet], matches: M) -> Vec<String> {
        let mut vms: Vec<String> = Vec::new();
        for set in sets {
            if let Verdict::Allow(vm) = set.verdict(matches) {
                if !vms.contains(&vm) {
                    vms.push(vm);
                }
            }
        }
        vms
    }
}
