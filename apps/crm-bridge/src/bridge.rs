use std::collections::BTreeMap;

use chrono::Utc;
use crm_directory::{
    ContactAddress, ContactRecord, SyncStatus, is_temporary_id, new_temporary_id,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::store::CacheStoreError;
use crate::cache::types::{CacheFreshness, ContactQuery};
use crate::queue::store::QueueStoreError;
use crate::queue::types::{OperationKind, QueueOperation, QueueStats};
use crate::store::{BridgeStore, StageError};
use crate::sync::scheduler::{SyncStatusReader, SyncStatusSnapshot, SyncTrigger};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Store(String),
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Store(_) => "store_unavailable",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::InvalidRequest(message)
            | Self::NotFound(message)
            | Self::Conflict(message)
            | Self::Store(message) => message.clone(),
        }
    }
}

impl From<CacheStoreError> for BridgeError {
    fn from(error: CacheStoreError) -> Self {
        match error {
            CacheStoreError::NotFound(message) => Self::NotFound(message),
            CacheStoreError::Db(message) => Self::Store(message),
        }
    }
}

impl From<QueueStoreError> for BridgeError {
    fn from(error: QueueStoreError) -> Self {
        match error {
            QueueStoreError::Conflict(message) => Self::Conflict(message),
            QueueStoreError::NotFound(message) => Self::NotFound(message),
            QueueStoreError::Db(message) => Self::Store(message),
        }
    }
}

impl From<StageError> for BridgeError {
    fn from(error: StageError) -> Self {
        match error {
            StageError::Cache(error) => error.into(),
            StageError::Queue(error) => error.into(),
            StageError::Db(message) => Self::Store(message),
        }
    }
}

/// Caller-supplied contact fields. Without an `id` the draft creates a new
/// contact; with a remote id it updates that contact.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ContactDraft {
    pub id: Option<String>,
    pub display_name: String,
    pub first_name: String,
    pub last_name: String,
    pub company_name: String,
    pub email: String,
    pub phone: String,
    pub address: Option<ContactAddress>,
    pub custom_fields: BTreeMap<String, Value>,
}

impl ContactDraft {
    fn has_identity(&self) -> bool {
        [
            &self.display_name,
            &self.first_name,
            &self.last_name,
            &self.company_name,
        ]
        .iter()
        .any(|value| !value.trim().is_empty())
    }

    fn into_record(self, id: String) -> ContactRecord {
        let first_name = self.first_name.trim().to_string();
        let last_name = self.last_name.trim().to_string();
        let mut display_name = self.display_name.trim().to_string();
        if display_name.is_empty() {
            display_name = format!("{first_name} {last_name}").trim().to_string();
        }
        ContactRecord {
            id,
            display_name,
            first_name,
            last_name,
            company_name: self.company_name.trim().to_string(),
            email: self.email.trim().to_string(),
            phone: self.phone.trim().to_string(),
            address: self.address.filter(|address| !address.is_empty()),
            custom_fields: self.custom_fields,
            sync_status: SyncStatus::PendingSync,
            last_synced_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmittedWrite {
    /// Temporary id for creates; replaced by the remote id once the write is pushed.
    pub contact_id: String,
    pub operation_id: String,
    pub operation_kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BridgeSyncStatus {
    pub scheduler: SyncStatusSnapshot,
    pub pending_writes: u64,
    pub failed_writes: u64,
    pub store_backend: &'static str,
}

/// Cache-first entry point for callers. Nothing here waits on the remote directory.
#[derive(Clone)]
pub struct ContactBridge {
    store: BridgeStore,
    trigger: SyncTrigger,
    status: SyncStatusReader,
    max_attempts: u32,
}

impl ContactBridge {
    pub fn new(
        store: BridgeStore,
        trigger: SyncTrigger,
        status: SyncStatusReader,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            trigger,
            status,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Stages the write in the cache and queue and returns immediately.
    pub async fn submit_write(&self, draft: ContactDraft) -> Result<SubmittedWrite, BridgeError> {
        let now = Utc::now();
        let requested_id = draft
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(ToString::to_string);

        let (operation_kind, record) = match requested_id {
            None => {
                if !draft.has_identity() {
                    return Err(BridgeError::InvalidRequest(
                        "a contact needs a name or a company".to_string(),
                    ));
                }
                let mut record = draft.into_record(new_temporary_id(now));
                if record.display_name.is_empty() {
                    record.display_name.clone_from(&record.company_name);
                }
                (OperationKind::Create, record)
            }
            Some(id) if is_temporary_id(&id) => {
                return Err(BridgeError::Conflict(format!(
                    "contact {id} has not been created remotely yet"
                )));
            }
            Some(id) => {
                let mut merged = self
                    .store
                    .cache
                    .get(&id)
                    .await?
                    .ok_or_else(|| BridgeError::NotFound(format!("contact {id}")))?;
                if let Some(open) = self.store.queue.open_entry_for(&id).await? {
                    return Err(BridgeError::Conflict(format!(
                        "contact {id} already has write {} in flight",
                        open.id
                    )));
                }
                let mut incoming = draft.into_record(id);
                incoming.last_synced_at = merged.last_synced_at;
                merged.merge_from(&incoming);
                (OperationKind::Update, merged)
            }
        };

        let operation = QueueOperation::new(operation_kind, &record, self.max_attempts, now)
            .map_err(|error| BridgeError::Store(error.to_string()))?;
        let submitted = SubmittedWrite {
            contact_id: record.id.clone(),
            operation_id: operation.id.clone(),
            operation_kind,
        };
        self.store.stage_write(record, operation).await?;

        tracing::info!(
            contact_id = %submitted.contact_id,
            operation_id = %submitted.operation_id,
            kind = operation_kind.as_str(),
            "crm write accepted"
        );
        Ok(submitted)
    }

    pub async fn read(&self, query: &ContactQuery) -> Result<Vec<ContactRecord>, BridgeError> {
        Ok(self.store.cache.search(query, Utc::now()).await?)
    }

    pub async fn get(&self, contact_id: &str) -> Result<ContactRecord, BridgeError> {
        self.store
            .cache
            .get(contact_id)
            .await?
            .ok_or_else(|| BridgeError::NotFound(format!("contact {contact_id}")))
    }

    /// Fire-and-forget: both loops run one extra cycle as soon as they are idle.
    pub fn trigger_manual_sync(&self) {
        self.trigger.fire();
        tracing::debug!("crm manual sync requested");
    }

    pub async fn cache_info(&self) -> Result<CacheFreshness, BridgeError> {
        Ok(self.store.cache.freshness(Utc::now()).await?)
    }

    pub async fn queue_status(&self) -> Result<QueueStats, BridgeError> {
        Ok(self.store.queue.stats().await?)
    }

    pub async fn sync_status(&self) -> Result<BridgeSyncStatus, BridgeError> {
        let stats = self.store.queue.stats().await?;
        Ok(BridgeSyncStatus {
            scheduler: self.status.snapshot().await,
            pending_writes: stats.open(),
            failed_writes: stats.failed,
            store_backend: self.store.backend_name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crm_directory::{ContactRecord, InMemoryDirectory, SyncStatus, is_temporary_id};

    use super::{BridgeError, ContactBridge, ContactDraft};
    use crate::cache::ContactQuery;
    use crate::queue::types::{OperationKind, QueueStatus};
    use crate::store::BridgeStore;
    use crate::sync::{DrainConfig, RefreshPolicy, SyncScheduler, SyncStatusReader, SyncTrigger};

    fn bridge(store: &BridgeStore) -> ContactBridge {
        ContactBridge::new(
            store.clone(),
            SyncTrigger::default(),
            SyncStatusReader::default(),
            5,
        )
    }

    fn draft(name: &str) -> ContactDraft {
        ContactDraft {
            display_name: name.to_string(),
            email: "owner@station.example".to_string(),
            ..ContactDraft::default()
        }
    }

    #[tokio::test]
    async fn new_contact_is_readable_immediately_with_a_temporary_id() -> anyhow::Result<()> {
        let store = BridgeStore::memory();
        let bridge = bridge(&store);

        let submitted = bridge.submit_write(draft("Corner Station")).await?;
        assert!(is_temporary_id(&submitted.contact_id));
        assert_eq!(submitted.operation_kind, OperationKind::Create);

        let found = bridge.read(&ContactQuery::text("corner")).await?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, submitted.contact_id);
        assert_eq!(found[0].sync_status, SyncStatus::PendingSync);

        let queued = store
            .queue
            .get(&submitted.operation_id)
            .await?
            .expect("queued");
        assert_eq!(queued.status, QueueStatus::Pending);
        assert_eq!(queued.contact_id, submitted.contact_id);
        Ok(())
    }

    #[tokio::test]
    async fn company_only_contact_uses_company_as_display_name() -> anyhow::Result<()> {
        let bridge = bridge(&BridgeStore::memory());
        let submitted = bridge
            .submit_write(ContactDraft {
                company_name: "Phillips Fuel".to_string(),
                ..ContactDraft::default()
            })
            .await?;
        let record = bridge.get(&submitted.contact_id).await?;
        assert_eq!(record.display_name, "Phillips Fuel");
        Ok(())
    }

    #[tokio::test]
    async fn nameless_drafts_are_rejected() {
        let bridge = bridge(&BridgeStore::memory());
        let error = bridge
            .submit_write(ContactDraft {
                email: "nobody@example.com".to_string(),
                ..ContactDraft::default()
            })
            .await
            .expect_err("draft without name should fail");
        assert_eq!(error.code(), "invalid_request");
    }

    #[tokio::test]
    async fn update_merges_onto_cached_contact_and_blocks_a_second_write() -> anyhow::Result<()> {
        let store = BridgeStore::memory();
        let bridge = bridge(&store);
        let mut existing = ContactRecord::new("321");
        existing.display_name = "Existing Owner".to_string();
        existing.phone = "555-0100".to_string();
        existing.sync_status = SyncStatus::Synced;
        store.cache.upsert(existing).await?;

        let submitted = bridge
            .submit_write(ContactDraft {
                id: Some("321".to_string()),
                email: "new@owner.example".to_string(),
                ..ContactDraft::default()
            })
            .await?;
        assert_eq!(submitted.operation_kind, OperationKind::Update);
        let record = bridge.get("321").await?;
        assert_eq!(record.phone, "555-0100");
        assert_eq!(record.email, "new@owner.example");
        assert_eq!(record.sync_status, SyncStatus::PendingSync);

        let second = bridge
            .submit_write(ContactDraft {
                id: Some("321".to_string()),
                phone: "555-0199".to_string(),
                ..ContactDraft::default()
            })
            .await;
        assert!(matches!(second, Err(BridgeError::Conflict(_))));
        assert_eq!(bridge.get("321").await?.phone, "555-0100");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_and_temporary_ids_are_rejected() -> anyhow::Result<()> {
        let bridge = bridge(&BridgeStore::memory());
        let missing = bridge
            .submit_write(ContactDraft {
                id: Some("999".to_string()),
                ..draft("Ghost")
            })
            .await;
        assert!(matches!(missing, Err(BridgeError::NotFound(_))));

        let created = bridge.submit_write(draft("Pending Co")).await?;
        let temp = bridge
            .submit_write(ContactDraft {
                id: Some(created.contact_id.clone()),
                ..draft("Pending Co Renamed")
            })
            .await;
        assert!(matches!(temp, Err(BridgeError::Conflict(_))));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn manual_sync_pushes_the_write_and_reports_status() -> anyhow::Result<()> {
        let store = BridgeStore::memory();
        let directory = Arc::new(InMemoryDirectory::default());
        let scheduler = SyncScheduler::new(
            store.clone(),
            directory.clone(),
            DrainConfig::default(),
            RefreshPolicy {
                request_delay: Duration::ZERO,
                ..RefreshPolicy::default()
            },
        );
        let bridge = ContactBridge::new(store.clone(), scheduler.trigger(), scheduler.status(), 5);
        let handle = scheduler.spawn();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let submitted = bridge.submit_write(draft("Late Arrival")).await?;
        assert_eq!(bridge.sync_status().await?.pending_writes, 1);

        bridge.trigger_manual_sync();
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        let status = bridge.sync_status().await?;
        assert_eq!(status.pending_writes, 0);
        assert_eq!(status.scheduler.pushed_total, 1);
        assert_eq!(status.store_backend, "memory");
        assert!(bridge.get(&submitted.contact_id).await.is_err());
        let synced = bridge.read(&ContactQuery::text("late arrival")).await?;
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].id, "5000");
        assert_eq!(bridge.queue_status().await?.completed, 1);
        assert_eq!(bridge.cache_info().await?.total, 1);

        handle.shutdown().await;
        Ok(())
    }
}
