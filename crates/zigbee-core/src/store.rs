//! nwkid-keyed device store
//!
//! Owns the table of known devices and answers the transport's
//! [`CommandHistory`] queries during APS failure handling.

use crate::device::ZigbeeDevice;
use dashmap::DashMap;
use std::time::Instant;
use zigate_protocol::{CommandHistory, CommandRecord};

/// Known devices, keyed by their network short address
#[derive(Debug, Default)]
pub struct DeviceStore {
    devices: DashMap<u16, ZigbeeDevice>,
}

impl DeviceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a device
    pub fn insert(&self, device: ZigbeeDevice) {
        self.devices.insert(device.nwk_address, device);
    }

    /// Register a bare device if the address is new
    pub fn register(&self, nwkid: u16) {
        self.devices
            .entry(nwkid)
            .or_insert_with(|| ZigbeeDevice::new(nwkid));
    }

    /// Snapshot of one device
    #[must_use]
    pub fn get(&self, nwkid: u16) -> Option<ZigbeeDevice> {
        self.devices.get(&nwkid).map(|entry| entry.value().clone())
    }

    /// Mark a device as alive right now
    pub fn touch(&self, nwkid: u16) {
        if let Some(mut device) = self.devices.get_mut(&nwkid) {
            device.last_seen = Some(Instant::now());
        }
    }

    pub fn remove(&self, nwkid: u16) -> Option<ZigbeeDevice> {
        self.devices.remove(&nwkid).map(|(_, device)| device)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Snapshot of every device, for persistence and listings
    #[must_use]
    pub fn devices(&self) -> Vec<ZigbeeDevice> {
        self.devices.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl CommandHistory for DeviceStore {
    fn contains(&self, nwkid: u16) -> bool {
        self.devices.contains_key(&nwkid)
    }

    fn record(&self, nwkid: u16, record: CommandRecord) {
        if let Some(mut device) = self.devices.get_mut(&nwkid) {
            device.last_seen = Some(record.at);
            device.push_cmd(record);
        }
    }

    fn recent(&self, nwkid: u16, limit: usize) -> Vec<CommandRecord> {
        self.devices
            .get(&nwkid)
            .map(|device| {
                device
                    .last_cmds
                    .iter()
                    .rev()
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent() {
        let store = DeviceStore::new();
        store.register(0x1234);
        store.register(0x1234);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_recording_against_unknown_device_is_a_noop() {
        let store = DeviceStore::new();
        store.record(0x1234, CommandRecord::new(0x0092, None));
        assert!(!store.contains(0x1234));
        assert!(store.recent(0x1234, 3).is_empty());
    }

    #[test]
    fn test_recent_returns_newest_first() {
        let store = DeviceStore::new();
        store.register(0x1234);
        store.record(0x1234, CommandRecord::new(0x0092, Some(vec![0x01])));
        store.record(0x1234, CommandRecord::new(0x0100, Some(vec![0x02])));
        store.record(0x1234, CommandRecord::new(0x0110, Some(vec![0x03])));

        let recent = store.recent(0x1234, 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].opcode, 0x0110);
        assert_eq!(recent[1].opcode, 0x0100);
    }

    #[test]
    fn test_recording_touches_the_device() {
        let store = DeviceStore::new();
        store.register(0x1234);
        assert!(store.get(0x1234).and_then(|d| d.last_seen).is_none());
        store.record(0x1234, CommandRecord::new(0x0092, None));
        assert!(store.get(0x1234).and_then(|d| d.last_seen).is_some());
    }
}
