//! Per-path critical sections
//!
//! Every mutator of a shared store entry holds the local lock for that entry's
//! path while it reads and writes. Locks are created on demand, reference
//! counted, and dropped from the registry once nobody holds or waits for them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    refs: usize,
}

/// Registry of async mutexes keyed by store path
#[derive(Clone, Default)]
pub struct PathLockRegistry {
    slots: Arc<Mutex<HashMap<String, Slot>>>,
}

impl PathLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `path`
    pub async fn lock(&self, path: &str) -> PathGuard {
        let (mutex, slot) = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let entry = slots.entry(path.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(AsyncMutex::new(())),
                refs: 0,
            });
            entry.refs += 1;
            let slot = SlotRef {
                registry: self.clone(),
                path: path.to_string(),
            };
            (Arc::clone(&entry.mutex), slot)
        };

        // A caller that gives up while waiting drops `slot` and its count
        let guard = mutex.lock_owned().await;
        PathGuard { _guard: guard, slot }
    }

    /// Number of paths currently locked or awaited
    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn release(&self, path: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(path) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(path);
            }
        }
    }
}

/// One counted interest in a slot, holder or waiter
struct SlotRef {
    registry: PathLockRegistry,
    path: String,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

/// Held critical section on one path
pub struct PathGuard {
    // Declared first so the mutex unlocks before the slot can be removed
    _guard: OwnedMutexGuard<()>,
    slot: SlotRef,
}

impl PathGuard {
    pub fn path(&self) -> &str {
        &self.slot.path
    }
}
