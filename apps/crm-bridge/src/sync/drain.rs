use std::time::Duration;

use chrono::{DateTime, Utc};
use crm_directory::{ContactRecord, DirectoryError, RemoteDirectory, SyncStatus};
use serde::Serialize;

use crate::cache::store::{CacheStoreError, ContactCache};
use crate::queue::store::{QueueStoreError, WriteQueue};
use crate::queue::types::{OperationKind, QueueOperation, QueueStatus};

#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub interval: Duration,
    /// Operations pushed per cycle. Kept small to stay under the remote rate limit.
    pub batch_size: usize,
    /// How long a dequeued operation stays claimed before it can be reclaimed.
    pub lease: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 5,
            lease: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error(transparent)]
    Cache(#[from] CacheStoreError),
    #[error(transparent)]
    Queue(#[from] QueueStoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub reclaimed: usize,
    pub dequeued: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Runs one drain cycle: reclaims expired leases, then pushes the oldest
/// pending operations to the remote directory in enqueue order.
///
/// Remote failures are recorded on the operation. Local store failures end
/// the cycle; operations still leased are picked up again once their lease
/// runs out.
pub async fn drain_once(
    cache: &dyn ContactCache,
    queue: &dyn WriteQueue,
    directory: &dyn RemoteDirectory,
    config: &DrainConfig,
    now: DateTime<Utc>,
) -> Result<DrainReport, DrainError> {
    let mut report = DrainReport::default();

    for operation in queue.reclaim_expired(now).await? {
        report.reclaimed += 1;
        tracing::warn!(
            operation_id = %operation.id,
            contact_id = %operation.contact_id,
            attempts = operation.attempts,
            status = operation.status.as_str(),
            "crm write queue lease expired"
        );
        if operation.status == QueueStatus::Failed {
            mark_cache_failed(cache, &operation.contact_id).await?;
        }
    }

    let lease = chrono::Duration::from_std(config.lease).unwrap_or(chrono::Duration::MAX);
    let lease_expires_at = now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC);
    let batch = queue
        .dequeue_batch(config.batch_size, lease_expires_at)
        .await?;
    report.dequeued = batch.len();

    for operation in batch {
        let record = match operation.payload_record() {
            Ok(record) => record,
            Err(error) => {
                let message = format!("undecodable payload: {error}");
                settle_failure(cache, queue, &operation, &message, true, now, &mut report).await?;
                continue;
            }
        };

        match push(directory, &operation, &record).await {
            Ok(remote_id) => {
                let mut synced = record;
                synced.sync_status = SyncStatus::Synced;
                synced.last_synced_at = Some(now);
                match remote_id {
                    Some(remote_id) => {
                        synced.id.clone_from(&remote_id);
                        cache.rekey(&operation.contact_id, synced).await?;
                    }
                    None => {
                        cache.upsert(synced).await?;
                    }
                }
                queue.complete(&operation.id, now).await?;
                report.completed += 1;
                tracing::info!(
                    operation_id = %operation.id,
                    contact_id = %operation.contact_id,
                    kind = operation.operation_kind.as_str(),
                    "crm write pushed to directory"
                );
            }
            Err(error) => {
                settle_failure(
                    cache,
                    queue,
                    &operation,
                    &error.to_string(),
                    error.is_permanent(),
                    now,
                    &mut report,
                )
                .await?;
            }
        }
    }

    Ok(report)
}

/// Returns the remote-issued id for creates.
async fn push(
    directory: &dyn RemoteDirectory,
    operation: &QueueOperation,
    record: &ContactRecord,
) -> Result<Option<String>, DirectoryError> {
    match operation.operation_kind {
        OperationKind::Create => directory.create(record).await.map(Some),
        OperationKind::Update => directory.update(record).await.map(|()| None),
    }
}

async fn settle_failure(
    cache: &dyn ContactCache,
    queue: &dyn WriteQueue,
    operation: &QueueOperation,
    message: &str,
    permanent: bool,
    now: DateTime<Utc>,
    report: &mut DrainReport,
) -> Result<(), DrainError> {
    let status = queue.fail(&operation.id, message, permanent, now).await?;
    tracing::warn!(
        operation_id = %operation.id,
        contact_id = %operation.contact_id,
        attempts = operation.attempts,
        max_attempts = operation.max_attempts,
        status = status.as_str(),
        reason = message,
        "crm write push failed"
    );
    if status == QueueStatus::Failed {
        report.failed += 1;
        mark_cache_failed(cache, &operation.contact_id).await?;
    } else {
        report.retried += 1;
    }
    Ok(())
}

async fn mark_cache_failed(cache: &dyn ContactCache, contact_id: &str) -> Result<(), DrainError> {
    match cache.set_sync_status(contact_id, SyncStatus::Failed).await {
        Ok(()) => Ok(()),
        Err(CacheStoreError::NotFound(_)) => {
            tracing::debug!(contact_id, "failed write has no cached contact");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}
