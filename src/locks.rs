//! Per-infection serialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::infection::InfectionId;

pub type IdGuard = OwnedMutexGuard<()>;

/// One async mutex per infection id. Operations on the same id queue up;
/// different ids never contend.
#[derive(Default)]
pub struct LockMap {
    locks: Mutex<HashMap<InfectionId, Arc<AsyncMutex<()>>>>,
}

impl LockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots nobody holds or waits on are pruned here, so the map stays as
    /// small as the set of ids currently in use.
    fn slot(&self, id: &InfectionId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|key, slot| key == id || Arc::strong_count(slot) > 1);
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    pub async fn lock(&self, id: &InfectionId) -> IdGuard {
        self.slot(id).lock_owned().await
    }

    /// `None` when another operation holds the id.
    pub fn try_lock(&self, id: &InfectionId) -> Option<IdGuard> {
        self.slot(id).try_lock_owned().ok()
    }

    /// Drop the slot for a removed infection if nobody else references it.
    pub fn forget(&self, id: &InfectionId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    pub fn slot_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
