use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::GenericClient;
use tokio_postgres::error::SqlState;

use crate::db::BridgeDb;
use crate::queue::types::{
    FailedOperationSummary, LEASE_EXPIRED_MESSAGE, OperationKind, QueueOperation, QueueStats,
    QueueStatus, RECENT_FAILURE_LIMIT,
};

#[derive(Debug, thiserror::Error)]
pub enum QueueStoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Durable, ordered outbox of contact mutations.
#[async_trait]
pub trait WriteQueue: Send + Sync {
    /// Appends a pending operation. Rejects a second open operation for the same contact.
    async fn enqueue(&self, operation: QueueOperation) -> Result<(), QueueStoreError>;

    /// Claims up to `limit` pending operations, oldest first, marking them
    /// `processing` and counting the attempt.
    async fn dequeue_batch(
        &self,
        limit: usize,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<QueueOperation>, QueueStoreError>;

    async fn complete(&self, operation_id: &str, now: DateTime<Utc>)
    -> Result<(), QueueStoreError>;

    /// Records a failed attempt and returns the resulting status.
    async fn fail(
        &self,
        operation_id: &str,
        error_message: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<QueueStatus, QueueStoreError>;

    /// Returns `processing` operations whose lease ran out to `pending`, or
    /// to `failed` when no attempts remain. Returns the reclaimed operations.
    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueOperation>, QueueStoreError>;

    async fn get(&self, operation_id: &str) -> Result<Option<QueueOperation>, QueueStoreError>;

    async fn open_entry_for(
        &self,
        contact_id: &str,
    ) -> Result<Option<QueueOperation>, QueueStoreError>;

    async fn stats(&self) -> Result<QueueStats, QueueStoreError>;
}

pub fn memory() -> Arc<dyn WriteQueue> {
    Arc::new(MemoryWriteQueue::default())
}

pub fn postgres(db: Arc<BridgeDb>) -> Arc<dyn WriteQueue> {
    Arc::new(PostgresWriteQueue { db })
}

#[derive(Default)]
struct MemoryWriteQueue {
    // Insertion order doubles as the tie-breaker for equal `created_at`.
    inner: Mutex<Vec<QueueOperation>>,
}

fn find_open<'a>(
    entries: &'a mut [QueueOperation],
    operation_id: &str,
) -> Result<&'a mut QueueOperation, QueueStoreError> {
    let entry = entries
        .iter_mut()
        .find(|entry| entry.id == operation_id)
        .ok_or_else(|| QueueStoreError::NotFound(format!("operation {operation_id}")))?;
    if entry.status.is_terminal() {
        return Err(QueueStoreError::Conflict(format!(
            "operation {operation_id} is already {}",
            entry.status.as_str()
        )));
    }
    Ok(entry)
}

#[async_trait]
impl WriteQueue for MemoryWriteQueue {
    async fn enqueue(&self, operation: QueueOperation) -> Result<(), QueueStoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .iter()
            .any(|entry| entry.contact_id == operation.contact_id && !entry.status.is_terminal())
        {
            return Err(QueueStoreError::Conflict(format!(
                "contact {} already has an open operation",
                operation.contact_id
            )));
        }
        if inner.iter().any(|entry| entry.id == operation.id) {
            return Err(QueueStoreError::Conflict(format!(
                "operation {} already exists",
                operation.id
            )));
        }
        inner.push(operation);
        Ok(())
    }

    async fn dequeue_batch(
        &self,
        limit: usize,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<QueueOperation>, QueueStoreError> {
        let mut inner = self.inner.lock().await;
        let mut candidates: Vec<usize> = inner
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_dequeueable())
            .map(|(index, _)| index)
            .collect();
        candidates.sort_by_key(|index| inner[*index].created_at);
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for index in candidates {
            let entry = &mut inner[index];
            entry.status = QueueStatus::Processing;
            entry.attempts = entry.attempts.saturating_add(1);
            entry.lease_expires_at = Some(lease_expires_at);
            claimed.push(entry.clone());
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        operation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let mut inner = self.inner.lock().await;
        let entry = find_open(&mut inner, operation_id)?;
        entry.status = QueueStatus::Completed;
        entry.processed_at = Some(now);
        entry.lease_expires_at = None;
        entry.error_message = None;
        Ok(())
    }

    async fn fail(
        &self,
        operation_id: &str,
        error_message: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<QueueStatus, QueueStoreError> {
        let mut inner = self.inner.lock().await;
        let entry = find_open(&mut inner, operation_id)?;
        entry.status = entry.status_after_failure(permanent);
        entry.error_message = Some(error_message.to_string());
        entry.processed_at = Some(now);
        entry.lease_expires_at = None;
        Ok(entry.status)
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueOperation>, QueueStoreError> {
        let mut inner = self.inner.lock().await;
        let mut reclaimed = Vec::new();
        for entry in inner.iter_mut().filter(|entry| {
            entry.status == QueueStatus::Processing
                && entry.lease_expires_at.is_some_and(|deadline| deadline < now)
        }) {
            entry.status = entry.status_after_failure(false);
            entry.lease_expires_at = None;
            if entry.status == QueueStatus::Failed {
                entry.error_message = Some(LEASE_EXPIRED_MESSAGE.to_string());
                entry.processed_at = Some(now);
            }
            reclaimed.push(entry.clone());
        }
        Ok(reclaimed)
    }

    async fn get(&self, operation_id: &str) -> Result<Option<QueueOperation>, QueueStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.iter().find(|entry| entry.id == operation_id).cloned())
    }

    async fn open_entry_for(
        &self,
        contact_id: &str,
    ) -> Result<Option<QueueOperation>, QueueStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .iter()
            .find(|entry| entry.contact_id == contact_id && !entry.status.is_terminal())
            .cloned())
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for entry in inner.iter() {
            stats.add(entry.status, 1);
            if !entry.status.is_terminal() {
                stats.oldest_open_at = Some(
                    stats
                        .oldest_open_at
                        .map_or(entry.created_at, |at| at.min(entry.created_at)),
                );
                stats.newest_open_at = stats.newest_open_at.max(Some(entry.created_at));
            }
        }
        let mut failures: Vec<&QueueOperation> = inner
            .iter()
            .filter(|entry| entry.status == QueueStatus::Failed)
            .collect();
        failures.sort_by(|left, right| {
            right
                .processed_at
                .cmp(&left.processed_at)
                .then_with(|| right.created_at.cmp(&left.created_at))
        });
        stats.recent_failures = failures
            .into_iter()
            .take(RECENT_FAILURE_LIMIT)
            .map(FailedOperationSummary::from)
            .collect();
        Ok(stats)
    }
}

struct PostgresWriteQueue {
    db: Arc<BridgeDb>,
}

const OPERATION_COLUMNS: &str = "operation_id, operation_kind, contact_id, payload, status, \
     attempts, max_attempts, created_at, processed_at, lease_expires_at, error_message";

/// Inserts `operation` on any client or transaction.
pub(crate) async fn insert_operation<C>(
    client: &C,
    operation: &QueueOperation,
) -> Result<(), QueueStoreError>
where
    C: GenericClient + Sync,
{
    let attempts = operation.attempts as i32;
    let max_attempts = operation.max_attempts as i32;
    client
        .execute(
            r#"
            INSERT INTO crm_write_queue (
                operation_id, operation_kind, contact_id, payload, status,
                attempts, max_attempts, created_at, processed_at, lease_expires_at, error_message
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
            "#,
            &[
                &operation.id,
                &operation.operation_kind.as_str(),
                &operation.contact_id,
                &operation.payload,
                &operation.status.as_str(),
                &attempts,
                &max_attempts,
                &operation.created_at,
                &operation.processed_at,
                &operation.lease_expires_at,
                &operation.error_message,
            ],
        )
        .await
        .map_err(|error| {
            if error.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                QueueStoreError::Conflict(format!(
                    "contact {} already has an open operation",
                    operation.contact_id
                ))
            } else {
                QueueStoreError::Db(error.to_string())
            }
        })?;
    Ok(())
}

impl PostgresWriteQueue {
    /// Distinguishes a missing operation from a terminal one after a guarded update matched nothing.
    async fn missing_or_terminal<C>(client: &C, operation_id: &str) -> QueueStoreError
    where
        C: GenericClient + Sync,
    {
        match client
            .query_opt(
                "SELECT status FROM crm_write_queue WHERE operation_id = $1",
                &[&operation_id],
            )
            .await
        {
            Ok(Some(row)) => match row.try_get::<_, String>("status") {
                Ok(status) => QueueStoreError::Conflict(format!(
                    "operation {operation_id} is already {status}"
                )),
                Err(error) => QueueStoreError::Db(error.to_string()),
            },
            Ok(None) => QueueStoreError::NotFound(format!("operation {operation_id}")),
            Err(error) => QueueStoreError::Db(error.to_string()),
        }
    }
}

#[async_trait]
impl WriteQueue for PostgresWriteQueue {
    async fn enqueue(&self, operation: QueueOperation) -> Result<(), QueueStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        insert_operation(&*client, &operation).await
    }

    async fn dequeue_batch(
        &self,
        limit: usize,
        lease_expires_at: DateTime<Utc>,
    ) -> Result<Vec<QueueOperation>, QueueStoreError> {
        let limit = limit as i64;
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                format!(
                    r#"
                    UPDATE crm_write_queue
                       SET status = 'processing',
                           attempts = attempts + 1,
                           lease_expires_at = $2
                     WHERE operation_id IN (
                           SELECT operation_id
                             FROM crm_write_queue
                            WHERE status = 'pending' AND attempts < max_attempts
                            ORDER BY created_at ASC, operation_id ASC
                            LIMIT $1
                              FOR UPDATE SKIP LOCKED
                     )
                    RETURNING {OPERATION_COLUMNS}
                    "#
                )
                .as_str(),
                &[&limit, &lease_expires_at],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        let mut claimed = rows
            .iter()
            .map(map_operation_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueStoreError::Db)?;
        // RETURNING order is unspecified.
        claimed.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(claimed)
    }

    async fn complete(
        &self,
        operation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), QueueStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE crm_write_queue
                   SET status = 'completed',
                       processed_at = $2,
                       lease_expires_at = NULL,
                       error_message = NULL
                 WHERE operation_id = $1
                   AND status IN ('pending', 'processing')
                "#,
                &[&operation_id, &now],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(Self::missing_or_terminal(&*client, operation_id).await);
        }
        Ok(())
    }

    async fn fail(
        &self,
        operation_id: &str,
        error_message: &str,
        permanent: bool,
        now: DateTime<Utc>,
    ) -> Result<QueueStatus, QueueStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                r#"
                UPDATE crm_write_queue
                   SET status = CASE
                           WHEN $3 OR attempts >= max_attempts THEN 'failed'
                           ELSE 'pending'
                       END,
                       error_message = $2,
                       processed_at = $4,
                       lease_expires_at = NULL
                 WHERE operation_id = $1
                   AND status IN ('pending', 'processing')
                RETURNING status
                "#,
                &[&operation_id, &error_message, &permanent, &now],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        let Some(row) = row else {
            return Err(Self::missing_or_terminal(&*client, operation_id).await);
        };
        let status: String = row
            .try_get("status")
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        QueueStatus::parse(&status)
            .ok_or_else(|| QueueStoreError::Db(format!("unknown queue status {status}")))
    }

    async fn reclaim_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueOperation>, QueueStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                format!(
                    r#"
                    UPDATE crm_write_queue
                       SET status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                           error_message = CASE
                               WHEN attempts >= max_attempts THEN $2
                               ELSE error_message
                           END,
                           processed_at = CASE
                               WHEN attempts >= max_attempts THEN $1
                               ELSE processed_at
                           END,
                           lease_expires_at = NULL
                     WHERE status = 'processing'
                       AND lease_expires_at < $1
                    RETURNING {OPERATION_COLUMNS}
                    "#
                )
                .as_str(),
                &[&now, &LEASE_EXPIRED_MESSAGE],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_operation_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(QueueStoreError::Db)
    }

    async fn get(&self, operation_id: &str) -> Result<Option<QueueOperation>, QueueStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!("SELECT {OPERATION_COLUMNS} FROM crm_write_queue WHERE operation_id = $1")
                    .as_str(),
                &[&operation_id],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_operation_row)
            .transpose()
            .map_err(QueueStoreError::Db)
    }

    async fn open_entry_for(
        &self,
        contact_id: &str,
    ) -> Result<Option<QueueOperation>, QueueStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!(
                    r#"
                    SELECT {OPERATION_COLUMNS}
                      FROM crm_write_queue
                     WHERE contact_id = $1
                       AND status IN ('pending', 'processing')
                    "#
                )
                .as_str(),
                &[&contact_id],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_operation_row)
            .transpose()
            .map_err(QueueStoreError::Db)
    }

    async fn stats(&self) -> Result<QueueStats, QueueStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let mut stats = QueueStats::default();

        let rows = client
            .query(
                "SELECT status, COUNT(*) AS count FROM crm_write_queue GROUP BY status",
                &[],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        for row in &rows {
            let status: String = row
                .try_get("status")
                .map_err(|error| QueueStoreError::Db(error.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|error| QueueStoreError::Db(error.to_string()))?;
            if let Some(status) = QueueStatus::parse(&status) {
                stats.add(status, count.max(0) as u64);
            }
        }

        let row = client
            .query_one(
                r#"
                SELECT MIN(created_at) AS oldest, MAX(created_at) AS newest
                  FROM crm_write_queue
                 WHERE status IN ('pending', 'processing')
                "#,
                &[],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        stats.oldest_open_at = row
            .try_get("oldest")
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        stats.newest_open_at = row
            .try_get("newest")
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;

        let limit = RECENT_FAILURE_LIMIT as i64;
        let rows = client
            .query(
                format!(
                    r#"
                    SELECT {OPERATION_COLUMNS}
                      FROM crm_write_queue
                     WHERE status = 'failed'
                     ORDER BY processed_at DESC NULLS LAST, created_at DESC
                     LIMIT $1
                    "#
                )
                .as_str(),
                &[&limit],
            )
            .await
            .map_err(|error| QueueStoreError::Db(error.to_string()))?;
        for row in &rows {
            let operation = map_operation_row(row).map_err(QueueStoreError::Db)?;
            stats
                .recent_failures
                .push(FailedOperationSummary::from(&operation));
        }
        Ok(stats)
    }
}

fn map_operation_row(row: &tokio_postgres::Row) -> Result<QueueOperation, String> {
    let operation_kind: String = row.try_get("operation_kind").map_err(|e| e.to_string())?;
    let status: String = row.try_get("status").map_err(|e| e.to_string())?;
    let attempts: i32 = row.try_get("attempts").map_err(|e| e.to_string())?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(|e| e.to_string())?;
    let payload: Value = row.try_get("payload").map_err(|e| e.to_string())?;

    Ok(QueueOperation {
        id: row.try_get("operation_id").map_err(|e| e.to_string())?,
        operation_kind: OperationKind::parse(&operation_kind)
            .ok_or_else(|| format!("unknown operation_kind {operation_kind}"))?,
        contact_id: row.try_get("contact_id").map_err(|e| e.to_string())?,
        payload,
        status: QueueStatus::parse(&status).ok_or_else(|| format!("unknown status {status}"))?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        created_at: row.try_get("created_at").map_err(|e| e.to_string())?,
        processed_at: row.try_get("processed_at").map_err(|e| e.to_string())?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(|e| e.to_string())?,
        error_message: row.try_get("error_message").map_err(|e| e.to_string())?,
    })
}
