use chrono::{DateTime, Utc};
use crm_directory::ContactRecord;
use serde::Serialize;
use serde_json::Value;

/// Error text recorded when a processing lease runs out on the final attempt.
pub const LEASE_EXPIRED_MESSAGE: &str = "processing lease expired";
pub const RECENT_FAILURE_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Outbox entry for one contact mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueOperation {
    pub id: String,
    pub operation_kind: OperationKind,
    /// Cache id the mutation applies to; a temporary id for creates.
    pub contact_id: String,
    pub payload: Value,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl QueueOperation {
    pub fn new(
        operation_kind: OperationKind,
        record: &ContactRecord,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: format!("wq_{}", uuid::Uuid::now_v7()),
            operation_kind,
            contact_id: record.id.clone(),
            payload: serde_json::to_value(record)?,
            status: QueueStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: now,
            processed_at: None,
            lease_expires_at: None,
            error_message: None,
        })
    }

    pub fn payload_record(&self) -> Result<ContactRecord, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    #[must_use]
    pub fn is_dequeueable(&self) -> bool {
        self.status == QueueStatus::Pending && self.attempts < self.max_attempts
    }

    /// Status after a failed attempt.
    #[must_use]
    pub fn status_after_failure(&self, permanent: bool) -> QueueStatus {
        if permanent || self.attempts >= self.max_attempts {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOperationSummary {
    pub id: String,
    pub operation_kind: OperationKind,
    pub contact_id: String,
    pub attempts: u32,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<&QueueOperation> for FailedOperationSummary {
    fn from(operation: &QueueOperation) -> Self {
        Self {
            id: operation.id.clone(),
            operation_kind: operation.operation_kind,
            contact_id: operation.contact_id.clone(),
            attempts: operation.attempts,
            error_message: operation.error_message.clone(),
            processed_at: operation.processed_at,
        }
    }
}

/// Queue depth and recent failures for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub oldest_open_at: Option<DateTime<Utc>>,
    pub newest_open_at: Option<DateTime<Utc>>,
    pub recent_failures: Vec<FailedOperationSummary>,
}

impl QueueStats {
    pub(crate) fn add(&mut self, status: QueueStatus, count: u64) {
        let slot = match status {
            QueueStatus::Pending => &mut self.pending,
            QueueStatus::Processing => &mut self.processing,
            QueueStatus::Completed => &mut self.completed,
            QueueStatus::Failed => &mut self.failed,
        };
        *slot = slot.saturating_add(count);
    }

    #[must_use]
    pub fn open(&self) -> u64 {
        self.pending.saturating_add(self.processing)
    }
}
