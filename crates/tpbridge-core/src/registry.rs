// ── Device registry ──
//
// In-memory table of the devices this plugin manages. Reads go straight
// to a `DashMap` and never block; mutations are serialized by a writer
// lock so the secondary index and the published snapshot stay consistent.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::debug;

use crate::model::{Device, SubDevice};

/// Snapshot of all registered devices, sorted by `device_id`.
pub type DeviceSnapshot = Arc<Vec<Arc<Device>>>;

/// Concurrent device store with push-based change notification.
pub struct DeviceRegistry {
    /// Primary storage: `device_id` -> device.
    by_id: DashMap<String, Arc<Device>>,

    /// Secondary index: `device_number` -> `device_id`.
    by_number: DashMap<String, String>,

    /// Serializes mutations.
    writer: Mutex<()>,

    /// Full snapshot, rebuilt on mutation.
    snapshot: watch::Sender<DeviceSnapshot>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            by_id: DashMap::new(),
            by_number: DashMap::new(),
            writer: Mutex::new(()),
            snapshot,
        }
    }

    /// Insert or replace a device. Duplicate sub-devices are collapsed
    /// first. Returns the previous entry, if any.
    pub fn upsert(&self, mut device: Device) -> Option<Arc<Device>> {
        device.dedup_sub_devices();
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let id = device.device_id.clone();
        let number = device.device_number.clone();
        let previous = self.by_id.insert(id.clone(), Arc::new(device));

        if let Some(old) = &previous {
            if old.device_number != number {
                self.by_number
                    .remove_if(&old.device_number, |_, owner| *owner == id);
            }
        }
        if !number.is_empty() {
            self.by_number.insert(number, id.clone());
        }

        debug!(device_id = %id, replaced = previous.is_some(), "device registered");
        self.rebuild_snapshot();
        previous
    }

    /// Remove a device and, with it, its sub-devices.
    pub fn remove(&self, device_id: &str) -> Option<Arc<Device>> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let (_, removed) = self.by_id.remove(device_id)?;
        self.by_number
            .remove_if(&removed.device_number, |_, id| id == device_id);
        debug!(device_id, "device removed");
        self.rebuild_snapshot();
        Some(removed)
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn find_by_number(&self, device_number: &str) -> Option<Arc<Device>> {
        let id = self.by_number.get(device_number)?.value().clone();
        self.get(&id)
    }

    /// Look up a sub-device by parent id and bus address.
    pub fn sub_device(&self, device_id: &str, address: &str) -> Option<SubDevice> {
        self.by_id
            .get(device_id)?
            .sub_device_by_address(address)
            .cloned()
    }

    /// Current snapshot (cheap `Arc` clone).
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn clear(&self) {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.by_id.clear();
        self.by_number.clear();
        self.rebuild_snapshot();
    }

    // ── Private helpers ──────────────────────────────────────────────

    /// Caller holds the writer lock.
    fn rebuild_snapshot(&self) {
        let mut values: Vec<Arc<Device>> = self.by_id.iter().map(|r| Arc::clone(r.value())).collect();
        values.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        // `send_modify` updates unconditionally, even with zero receivers.
        self.snapshot.send_modify(|snap| *snap = Arc::new(values));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn device(id: &str, number: &str) -> Device {
        Device::new(id, "voucher", number, "sensor", "mqtt")
    }

    #[test]
    fn upsert_returns_previous_entry() {
        let registry = DeviceRegistry::new();
        assert!(registry.upsert(device("d1", "N1")).is_none());

        let previous = registry.upsert(device("d1", "N1")).unwrap();
        assert_eq!(previous.device_id, "d1");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_by_number_follows_renumbering() {
        let registry = DeviceRegistry::new();
        registry.upsert(device("d1", "N1"));
        assert_eq!(registry.find_by_number("N1").unwrap().device_id, "d1");

        registry.upsert(device("d1", "N2"));
        assert!(registry.find_by_number("N1").is_none());
        assert_eq!(registry.find_by_number("N2").unwrap().device_id, "d1");
    }

    #[test]
    fn renumbering_keeps_index_entry_of_shared_number() {
        let registry = DeviceRegistry::new();
        registry.upsert(device("a", "N1"));
        registry.upsert(device("b", "N1"));

        registry.upsert(device("a", "N2"));
        assert_eq!(registry.find_by_number("N1").unwrap().device_id, "b");
        assert_eq!(registry.find_by_number("N2").unwrap().device_id, "a");
    }

    #[test]
    fn remove_drops_sub_devices_and_indexes() {
        let registry = DeviceRegistry::new();
        let mut gateway = device("gw", "GW-1");
        gateway.push_sub_device(SubDevice::new("s1", "v", "S-1", "0x01"));
        registry.upsert(gateway);
        assert_eq!(registry.sub_device("gw", "0x01").unwrap().device_id, "s1");

        let removed = registry.remove("gw").unwrap();
        assert_eq!(removed.sub_devices.len(), 1);
        assert!(registry.get("gw").is_none());
        assert!(registry.sub_device("gw", "0x01").is_none());
        assert!(registry.find_by_number("GW-1").is_none());
        assert!(registry.is_empty());
        assert!(registry.remove("gw").is_none());
    }

    #[test]
    fn upsert_collapses_duplicate_sub_devices() {
        let registry = DeviceRegistry::new();
        let mut gateway = device("gw", "GW-1");
        gateway.sub_devices = vec![
            SubDevice::new("s1", "v", "S-1", "1"),
            SubDevice::new("s1-new", "v", "S-1", "1"),
        ];
        registry.upsert(gateway);

        let stored = registry.get("gw").unwrap();
        assert_eq!(stored.sub_devices.len(), 1);
        assert_eq!(stored.sub_devices[0].device_id, "s1-new");
    }

    #[test]
    fn snapshot_is_sorted_and_pushed() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();

        registry.upsert(device("b", "2"));
        registry.upsert(device("a", "1"));
        assert!(rx.has_changed().unwrap());

        let ids: Vec<_> = rx
            .borrow_and_update()
            .iter()
            .map(|d| d.device_id.clone())
            .collect();
        assert_eq!(ids, ["a", "b"]);

        registry.clear();
        assert!(registry.snapshot().is_empty());
    }
}
