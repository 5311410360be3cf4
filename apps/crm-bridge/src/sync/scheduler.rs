use std::sync::Arc;

use chrono::{DateTime, Utc};
use crm_directory::RemoteDirectory;
use serde::Serialize;
use tokio::sync::{Notify, RwLock, watch};
use tokio::task::JoinHandle;

use crate::store::BridgeStore;
use crate::sync::drain::{DrainConfig, DrainReport, drain_once};
use crate::sync::refresh::{RefreshPolicy, RefreshReport, SyncState, refresh_once};

/// Point-in-time view of both background loops.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatusSnapshot {
    pub running: bool,
    pub drain_cycles: u64,
    pub last_drain_at: Option<DateTime<Utc>>,
    pub last_drain: Option<DrainReport>,
    pub last_drain_error: Option<String>,
    pub refresh_cycles: u64,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_refresh: Option<RefreshReport>,
    pub last_refresh_error: Option<String>,
    pub consecutive_refresh_failures: u32,
    pub next_refresh_delay_ms: u64,
    pub pushed_total: u64,
    pub refreshed_total: u64,
}

#[derive(Clone, Default)]
pub struct SyncStatusReader {
    inner: Arc<RwLock<SyncStatusSnapshot>>,
}

impl SyncStatusReader {
    pub async fn snapshot(&self) -> SyncStatusSnapshot {
        self.inner.read().await.clone()
    }
}

/// Requests one immediate cycle of both loops. Triggers that arrive while a
/// cycle is running are kept and served once it finishes.
#[derive(Clone, Default)]
pub struct SyncTrigger {
    drain: Arc<Notify>,
    refresh: Arc<Notify>,
}

impl SyncTrigger {
    pub fn fire(&self) {
        self.drain.notify_one();
        self.refresh.notify_one();
    }
}

pub struct SyncScheduler {
    store: BridgeStore,
    directory: Arc<dyn RemoteDirectory>,
    drain: DrainConfig,
    refresh: RefreshPolicy,
    trigger: SyncTrigger,
    status: SyncStatusReader,
}

impl SyncScheduler {
    pub fn new(
        store: BridgeStore,
        directory: Arc<dyn RemoteDirectory>,
        drain: DrainConfig,
        refresh: RefreshPolicy,
    ) -> Self {
        Self {
            store,
            directory,
            drain,
            refresh,
            trigger: SyncTrigger::default(),
            status: SyncStatusReader::default(),
        }
    }

    #[must_use]
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatusReader {
        self.status.clone()
    }

    /// Starts the drain and refresh loops. Each runs a cycle immediately.
    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler = Arc::new(self);

        let drain_task = tokio::spawn(run_drain_loop(scheduler.clone(), shutdown_rx.clone()));
        let refresh_task = tokio::spawn(run_refresh_loop(scheduler.clone(), shutdown_rx));
        tracing::info!(
            drain_interval_secs = scheduler.drain.interval.as_secs(),
            refresh_interval_secs = scheduler.refresh.interval.as_secs(),
            "crm sync scheduler started"
        );

        SchedulerHandle {
            shutdown: shutdown_tx,
            tasks: vec![drain_task, refresh_task],
            status: scheduler.status.clone(),
            trigger: scheduler.trigger.clone(),
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    status: SyncStatusReader,
    trigger: SyncTrigger,
}

impl SchedulerHandle {
    #[must_use]
    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    #[must_use]
    pub fn status(&self) -> SyncStatusReader {
        self.status.clone()
    }

    /// Signals both loops and waits for them to exit. A drain batch in flight completes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(error) = task.await {
                tracing::warn!(reason = %error, "crm sync loop exited abnormally");
            }
        }
        self.status.inner.write().await.running = false;
        tracing::info!("crm sync scheduler stopped");
    }
}

/// Sleeps for `delay` unless a trigger or shutdown arrives first. Returns false
/// once the shutdown sender is gone; the loop re-reads the flag otherwise.
async fn wait_for_next_cycle(
    delay: std::time::Duration,
    trigger: &Notify,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_ok(),
        () = trigger.notified() => {
            tracing::debug!("crm sync cycle triggered manually");
            true
        }
        () = tokio::time::sleep(delay) => true,
    }
}

async fn run_drain_loop(scheduler: Arc<SyncScheduler>, mut shutdown: watch::Receiver<bool>) {
    scheduler.status.inner.write().await.running = true;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        let outcome = drain_once(
            scheduler.store.cache.as_ref(),
            scheduler.store.queue.as_ref(),
            scheduler.directory.as_ref(),
            &scheduler.drain,
            now,
        )
        .await;

        {
            let mut status = scheduler.status.inner.write().await;
            status.drain_cycles += 1;
            status.last_drain_at = Some(now);
            match outcome {
                Ok(report) => {
                    if report.dequeued > 0 || report.reclaimed > 0 {
                        tracing::info!(
                            dequeued = report.dequeued,
                            completed = report.completed,
                            retried = report.retried,
                            failed = report.failed,
                            reclaimed = report.reclaimed,
                            "crm drain cycle finished"
                        );
                    }
                    status.pushed_total += report.completed as u64;
                    status.last_drain = Some(report);
                    status.last_drain_error = None;
                }
                Err(error) => {
                    tracing::warn!(reason = %error, "crm drain cycle failed");
                    status.last_drain_error = Some(error.to_string());
                }
            }
        }

        if !wait_for_next_cycle(
            scheduler.drain.interval,
            &scheduler.trigger.drain,
            &mut shutdown,
        )
        .await
        {
            break;
        }
    }
    tracing::debug!("crm drain loop stopped");
}

async fn run_refresh_loop(scheduler: Arc<SyncScheduler>, mut shutdown: watch::Receiver<bool>) {
    let mut state = SyncState::default();
    loop {
        if *shutdown.borrow() {
            break;
        }
        let now = Utc::now();
        let outcome = refresh_once(
            scheduler.store.cache.as_ref(),
            scheduler.directory.as_ref(),
            &scheduler.refresh,
            now,
            &shutdown,
        )
        .await;

        let delay = {
            let mut status = scheduler.status.inner.write().await;
            status.refresh_cycles += 1;
            status.last_refresh_at = Some(now);
            match outcome {
                Ok(report) => {
                    if report.is_cycle_failure() {
                        state.record_failure();
                    } else if !report.interrupted {
                        state.record_success();
                    }
                    status.refreshed_total += report.refreshed as u64;
                    status.last_refresh = Some(report);
                    status.last_refresh_error = None;
                }
                Err(error) => {
                    state.record_failure();
                    tracing::warn!(reason = %error, "crm refresh cycle failed");
                    status.last_refresh_error = Some(error.to_string());
                }
            }
            let delay = state.backoff_delay(&scheduler.refresh);
            status.consecutive_refresh_failures = state.consecutive_failures();
            status.next_refresh_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            delay
        };
        if state.consecutive_failures() > 0 {
            tracing::warn!(
                consecutive_failures = state.consecutive_failures(),
                delay_secs = delay.as_secs(),
                "crm refresh backing off"
            );
        }

        if !wait_for_next_cycle(delay, &scheduler.trigger.refresh, &mut shutdown).await {
            break;
        }
    }
    tracing::debug!("crm refresh loop stopped");
}
