//! Access gate shared by a `RecordStore` and the `BackupEngine` built on it.
//!
//! Store operations hold the gate shared, so they run alongside each other.
//! Restore holds it exclusively from the safety copy to the key reload: no
//! store operation can observe new storage with old keys, or the reverse.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;

#[derive(Default)]
pub struct AccessGate {
    lock: RwLock<()>,
}

impl fmt::Debug for AccessGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessGate")
            .field("exclusive", &self.lock.is_locked_exclusive())
            .finish()
    }
}

impl AccessGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Taken once per store operation. Never nest two shared holds on one thread.
    pub fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    pub fn try_shared(&self) -> Option<RwLockReadGuard<'_, ()>> {
        self.lock.try_read()
    }
}
