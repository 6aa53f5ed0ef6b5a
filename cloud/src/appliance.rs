//! Virtual appliances and the VMI repository.

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;

use vinfra_core::time::SimTime;

/// An immutable virtual-appliance record: the image a VM kind boots from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualAppliance {
    /// Appliance id; equals the VM kind it serves.
    pub id: String,

    /// Boot cost of a VM built from this appliance, in milliseconds.
    pub boot_cost_ms: SimTime,

    /// On-disk size in bytes.
    pub size_bytes: u64,
}

/// The cloud's single VMI repository.
///
/// Holds at most one appliance per id, bounded by a byte capacity.
/// Registration is all-or-nothing; the caller decides what to evict when
/// the store is full.
pub struct Repository {
    capacity_bytes: u64,
    transfer_bytes_per_ms: u64,
    contents: RefCell<BTreeMap<String, VirtualAppliance>>,
}

impl Repository {
    pub fn new(capacity_bytes: u64, transfer_bytes_per_ms: u64) -> Self {
        Self {
            capacity_bytes,
            transfer_bytes_per_ms,
            contents: RefCell::new(BTreeMap::new()),
        }
    }

    /// Look up an appliance by id.
    pub fn lookup(&self, id: &str) -> Option<VirtualAppliance> {
        self.contents.borrow().get(id).cloned()
    }

    /// Store an appliance. Returns false when it would not fit; storing an
    /// id that is already present is a no-op success.
    pub fn register_object(&self, va: VirtualAppliance) -> bool {
        let mut contents = self.contents.borrow_mut();
        if contents.contains_key(&va.id) {
            return true;
        }
        let used: u64 = contents.values().map(|v| v.size_bytes).sum();
        if used + va.size_bytes > self.capacity_bytes {
            return false;
        }
        tracing::debug!(id = %va.id, size_bytes = va.size_bytes, "appliance registered");
        contents.insert(va.id.clone(), va);
        true
    }

    /// Remove an appliance by id. Returns false when it was not present.
    pub fn deregister_object(&self, id: &str) -> bool {
        let removed = self.contents.borrow_mut().remove(id).is_some();
        if removed {
            tracing::debug!(id, "appliance deregistered");
        }
        removed
    }

    /// Ids of every stored appliance.
    pub fn contents(&self) -> Vec<String> {
        self.contents.borrow().keys().cloned().collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.contents.borrow().values().map(|v| v.size_bytes).sum()
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes - self.used_bytes()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Time to move `size_bytes` out of the repository.
    pub fn transfer_ms(&self, size_bytes: u64) -> SimTime {
        if self.transfer_bytes_per_ms == 0 {
            return 0;
        }
        size_bytes.div_ceil(self.transfer_bytes_per_ms)
    }
}
