use std::sync::Arc;

use std::sync::Mutex;

use crate::entities::ProgressRecord;
use crate::error::IngestError;
use crate::store::{ProgressStore, Store};

pub(crate) type ProgressCallback = Box<dyn Fn(&ProgressRecord) + Send + Sync>;

/// Persists progress records and broadcasts them to a registered
/// observer. The store enforces one writer per source per run; the mutex
/// here only guards the callback slot, the single piece of shared mutable
/// state outside the store.
pub(crate) struct ProgressTracker {
    store: Arc<dyn Store>,
    callback: Mutex<Option<ProgressCallback>>,
}

impl ProgressTracker {
    pub(crate) fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn set_callback(&self, callback: ProgressCallback) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = Some(callback);
        }
    }

    pub(crate) async fn update(&self, record: ProgressRecord) -> Result<(), IngestError> {
        self.store.put_progress(record.clone()).await?;
        if let Ok(slot) = self.callback.lock()
            && let Some(callback) = slot.as_ref()
        {
            callback(&record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{RunStatus, SourceName};
    use crate::store::{MemoryStore, ProgressStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn update_persists_and_broadcasts() {
        let store = Arc::new(MemoryStore::new());
        let tracker = ProgressTracker::new(store.clone());

        let broadcasts = Arc::new(AtomicU32::new(0));
        let seen = broadcasts.clone();
        tracker.set_callback(Box::new(move |record| {
            assert_eq!(record.source, SourceName::Gnomad);
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let mut record = crate::entities::ProgressRecord::idle(SourceName::Gnomad);
        record.status = RunStatus::Running;
        record.items_processed = 42;
        tracker.update(record).await.expect("update");

        assert_eq!(broadcasts.load(Ordering::SeqCst), 1);
        let stored = store
            .get_progress(SourceName::Gnomad)
            .await
            .expect("progress");
        assert_eq!(stored.items_processed, 42);
    }
}
