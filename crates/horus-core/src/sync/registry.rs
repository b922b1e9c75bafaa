//! In-process record of which devices are syncing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::types::SyncPhase;

/// At most one active run per device id.
#[derive(Debug, Default)]
pub struct SyncRegistry {
    active: Mutex<HashMap<String, SyncPhase>>,
}

impl SyncRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, SyncPhase>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the device, or `None` if a run already holds it.
    pub fn try_acquire(self: &Arc<Self>, device_id: &str) -> Option<SyncGuard> {
        let mut slots = self.slots();
        if slots.contains_key(device_id) {
            return None;
        }
        slots.insert(device_id.to_string(), SyncPhase::Idle);
        Some(SyncGuard {
            registry: Arc::clone(self),
            device_id: device_id.to_string(),
        })
    }

    pub fn is_active(&self, device_id: &str) -> bool {
        self.slots().contains_key(device_id)
    }

    pub fn phase(&self, device_id: &str) -> Option<SyncPhase> {
        self.slots().get(device_id).copied()
    }

    pub fn active_devices(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Holds a device's slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SyncGuard {
    registry: Arc<SyncRegistry>,
    device_id: String,
}

impl SyncGuard {
    pub fn set_phase(&self, phase: SyncPhase) {
        if let Some(slot) = self.registry.slots().get_mut(&self.device_id) {
            *slot = phase;
        }
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        self.registry.slots().remove(&self.device_id);
    }
}
