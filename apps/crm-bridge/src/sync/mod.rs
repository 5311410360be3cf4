//! Background reconciliation between the local cache and the remote directory.

pub mod drain;
pub mod refresh;
pub mod resync;
pub mod scheduler;

pub use drain::{DrainConfig, DrainError, DrainReport, drain_once};
pub use refresh::{RefreshPolicy, RefreshReport, SyncState, refresh_once};
pub use resync::{FullResyncPaginator, ResyncConfig, ResyncError, ResyncReport};
pub use scheduler::{
    SchedulerHandle, SyncScheduler, SyncStatusReader, SyncStatusSnapshot, SyncTrigger,
};
