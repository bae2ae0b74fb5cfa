//! Per-volume async mutexes serializing replica management.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::ObjectKey;

/// Lazily created lock per volume key.
///
/// The table itself sits behind a short synchronous lock; the returned
/// guard is an owned tokio guard that can be held across await points.
#[derive(Debug, Default)]
pub(crate) struct VolumeLocks {
    locks: Mutex<BTreeMap<ObjectKey, Arc<AsyncMutex<()>>>>,
}

impl VolumeLocks {
    pub(crate) async fn acquire(&self, volume: &ObjectKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.retain(|key, held| key == volume || Arc::strong_count(held) > 1);
            Arc::clone(locks.entry(volume.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
