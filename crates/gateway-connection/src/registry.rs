//! Local mirror of the gateway's devices.

use std::collections::BTreeMap;

use tradfri_protocol::{Device, DeviceId};

/// Last known state of every device, keyed by id.
///
/// Entries are only ever replaced whole. Writes report whether anything
/// changed so the caller can skip redundant UI notifications.
#[derive(Debug, Default, Clone)]
pub struct DeviceRegistry {
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a device. Returns `false` if it was identical.
    pub fn upsert(&mut self, device: Device) -> bool {
        match self.devices.get(&device.id) {
            Some(existing) if *existing == device => false,
            _ => {
                self.devices.insert(device.id, device);
                true
            }
        }
    }

    /// Makes the registry equal to a fresh fetch: devices the gateway no
    /// longer reports are dropped. Returns `true` if anything changed.
    pub fn reconcile(&mut self, fetched: Vec<Device>) -> bool {
        let fresh: BTreeMap<DeviceId, Device> = fetched.into_iter().map(|d| (d.id, d)).collect();
        if fresh == self.devices {
            return false;
        }
        self.devices = fresh;
        true
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    /// All devices ordered by id.
    pub fn all(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
