use std::sync::Arc;

use crm_directory::ContactRecord;

use crate::cache::store::{
    self as cache_store, CacheStoreError, ContactCache, MergeSource, upsert_contact,
};
use crate::db::BridgeDb;
use crate::queue::store::{self as queue_store, QueueStoreError, WriteQueue, insert_operation};
use crate::queue::types::QueueOperation;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Cache(#[from] CacheStoreError),
    #[error(transparent)]
    Queue(#[from] QueueStoreError),
    #[error("db error: {0}")]
    Db(String),
}

#[derive(Clone)]
enum Backend {
    Memory,
    Postgres(Arc<BridgeDb>),
}

/// Cache and queue repositories sharing one backend.
#[derive(Clone)]
pub struct BridgeStore {
    pub cache: Arc<dyn ContactCache>,
    pub queue: Arc<dyn WriteQueue>,
    backend: Backend,
}

impl BridgeStore {
    #[must_use]
    pub fn memory() -> Self {
        Self {
            cache: cache_store::memory(),
            queue: queue_store::memory(),
            backend: Backend::Memory,
        }
    }

    #[must_use]
    pub fn postgres(db: Arc<BridgeDb>) -> Self {
        Self {
            cache: cache_store::postgres(db.clone()),
            queue: queue_store::postgres(db.clone()),
            backend: Backend::Postgres(db),
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory => "memory",
            Backend::Postgres(_) => "postgres",
        }
    }

    /// Writes the cache row and its queue entry together. Either both land or neither does.
    pub async fn stage_write(
        &self,
        record: ContactRecord,
        operation: QueueOperation,
    ) -> Result<ContactRecord, StageError> {
        match &self.backend {
            Backend::Memory => {
                // The queue append is the only fallible step in memory.
                self.queue.enqueue(operation).await?;
                Ok(self.cache.upsert(record).await?)
            }
            Backend::Postgres(db) => {
                let client = db.client();
                let mut client = client.lock().await;
                let tx = client
                    .transaction()
                    .await
                    .map_err(|error| StageError::Db(error.to_string()))?;
                insert_operation(&tx, &operation).await?;
                let stored = upsert_contact(&tx, &record, MergeSource::Local).await?;
                tx.commit()
                    .await
                    .map_err(|error| StageError::Db(error.to_string()))?;
                Ok(stored)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use crm_directory::{ContactRecord, SyncStatus};

    use super::{BridgeStore, StageError};
    use crate::queue::store::QueueStoreError;
    use crate::queue::types::{OperationKind, QueueOperation};

    #[tokio::test]
    async fn staged_write_lands_in_cache_and_queue() -> anyhow::Result<()> {
        let store = BridgeStore::memory();
        let mut record = ContactRecord::new("TEMP_20260101_000000_0000abcd");
        record.display_name = "Ada Lovelace".to_string();
        let operation = QueueOperation::new(OperationKind::Create, &record, 5, Utc::now())?;
        let operation_id = operation.id.clone();

        let stored = store.stage_write(record, operation).await?;
        assert_eq!(stored.sync_status, SyncStatus::PendingSync);
        assert!(store.cache.get(&stored.id).await?.is_some());
        assert!(store.queue.get(&operation_id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn rejected_enqueue_leaves_cache_untouched() -> anyhow::Result<()> {
        let store = BridgeStore::memory();
        let mut record = ContactRecord::new("77");
        record.display_name = "First".to_string();
        let first = QueueOperation::new(OperationKind::Update, &record, 5, Utc::now())?;
        store.stage_write(record.clone(), first).await?;

        let mut second = record.clone();
        second.display_name = "Second".to_string();
        let operation = QueueOperation::new(OperationKind::Update, &second, 5, Utc::now())?;
        let result = store.stage_write(second, operation).await;
        assert!(matches!(
            result,
            Err(StageError::Queue(QueueStoreError::Conflict(_)))
        ));

        let cached = store.cache.get("77").await?.expect("cached");
        assert_eq!(cached.display_name, "First");
        Ok(())
    }
}
