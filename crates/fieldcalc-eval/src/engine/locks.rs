use std::sync::Arc;

use dashmap::DashMap;
use fieldcalc_common::RecordKey;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

/// Owned guard a cascade keeps for as long as it owns a record.
pub(crate) type RecordGuard = ArcMutexGuard<RawMutex, ()>;

/// One exclusive lock per record, created on first use.
///
/// A cascade takes the lock of a record before evaluating any of its units
/// and keeps it until that record's coalesced write is committed, so no
/// other cascade can commit in between. Different records never contend.
#[derive(Debug, Default)]
pub(crate) struct RecordLocks {
    locks: DashMap<RecordKey, Arc<Mutex<()>>>,
}

impl RecordLocks {
    pub(crate) fn lock_for(&self, key: RecordKey) -> Arc<Mutex<()>> {
        self.locks.entry(key).or_default().clone()
    }

    pub(crate) fn forget(&self, key: RecordKey) {
        self.locks.remove(&key);
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}
