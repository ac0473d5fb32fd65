//! In-memory attachment registry.
//!
//! Tracks which device is currently attached to which VM and enforces the
//! single-owner invariant: a device key appears at most once. All mutations
//! go through the orchestrator, which owns the registry.

use crate::error::{Error, Result};
use crate::types::{DeviceKey, DeviceKind};
use std::collections::HashMap;
use std::time::SystemTime;

/// One device-to-VM binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub key: DeviceKey,
    pub vm: String,
    pub kind: DeviceKind,
    pub attached_at: SystemTime,
}

/// Bidirectional device ↔ VM map.
#[derive(Debug, Default)]
pub struct AttachmentRegistry {
    by_key: HashMap<DeviceKey, Attachment>,
}

impl AttachmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a binding. Fails if the key is already bound.
    pub fn insert(&mut self, key: DeviceKey, vm: &str) -> Result<()> {
        if let Some(existing) = self.by_key.get(&key) {
            return Err(Error::AlreadyAttached { vm: existing.vm.clone() });
        }
        let attachment = Attachment {
            kind: key.kind(),
            key: key.clone(),
            vm: vm.to_string(),
            attached_at: SystemTime::now(),
        };
        self.by_key.insert(key, attachment);
        Ok(())
    }

    /// Remove a binding, returning it.
    pub fn remove(&mut self, key: &DeviceKey) -> Result<Attachment> {
        self.by_key.remove(key).ok_or(Error::NotAttached)
    }

    /// VM currently owning the key, if any.
    pub fn vm_for(&self, key: &DeviceKey) -> Option<&str> {
        self.by_key.get(key).map(|attachment| attachment.vm.as_str())
    }

    pub fn list_by_vm(&self, vm: &str) -> Vec<&Attachment> {
        self.by_key.values().filter(|attachment| attachment.vm == vm).collect()
    }

    pub fn list_by_kind(&self, kind: DeviceKind) -> Vec<&Attachment> {
        self.by_key.values().filter(|attachment| attachment.kind == kind).collect()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
