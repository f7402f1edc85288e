use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::document::DocId;

/// Per-document write locks
///
/// Writes to one id run one at a time in arrival order; different ids never
/// contend. Entries are dropped once nobody holds or waits on them.
#[derive(Default)]
pub(crate) struct DocLocks {
    locks: DashMap<DocId, Arc<Mutex<()>>>,
}

impl DocLocks {
    pub(crate) async fn acquire(&self, id: &DocId) -> DocLockGuard<'_> {
        let mutex = self.locks.entry(id.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        DocLockGuard {
            locks: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

pub(crate) struct DocLockGuard<'a> {
    locks: &'a DocLocks,
    id: DocId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DocLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
