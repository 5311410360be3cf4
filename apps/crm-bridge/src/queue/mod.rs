pub mod store;
pub mod types;

pub use store::{QueueStoreError, WriteQueue};
pub use types::{FailedOperationSummary, OperationKind, QueueOperation, QueueStats, QueueStatus};
