//! Input (evdev) device record.

use super::DeviceKey;

/// A host input device eligible for virtio-input passthrough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvdevDevice {
    /// Event node, `/dev/input/eventN`.
    pub node: String,
    pub name: Option<String>,
    pub phys: Option<String>,
    pub unique: Option<String>,
}

impl EvdevDevice {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::Evdev { node: self.node.clone() }
    }

    pub fn friendly_name(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.node, name),
            None => self.node.clone(),
        }
    }
}
