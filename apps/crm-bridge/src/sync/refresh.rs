use std::time::Duration;

use chrono::{DateTime, Utc};
use crm_directory::{RemoteDirectory, normalize_contact};
use serde::Serialize;
use tokio::sync::watch;

use crate::cache::store::{CacheStoreError, ContactCache};

/// Staleness-driven refresh cadence.
#[derive(Debug, Clone)]
pub struct RefreshPolicy {
    pub interval: Duration,
    /// Records not confirmed within this window are stale.
    pub stale_after: Duration,
    pub large_batch: usize,
    pub small_batch: usize,
    /// Stale counts above this use `large_batch`.
    pub bulk_threshold: u64,
    /// Pause between consecutive remote lookups.
    pub request_delay: Duration,
    pub max_backoff: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(2 * 60 * 60),
            large_batch: 50,
            small_batch: 20,
            bulk_threshold: 100,
            request_delay: Duration::from_millis(100),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl RefreshPolicy {
    /// Zero means the cycle is skipped.
    #[must_use]
    pub fn batch_size_for(&self, stale_count: u64) -> usize {
        if stale_count == 0 {
            0
        } else if stale_count > self.bulk_threshold {
            self.large_batch
        } else {
            self.small_batch
        }
    }

    #[must_use]
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Loop-level failure tracking for the refresh loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncState {
    consecutive_failures: u32,
}

impl SyncState {
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Sleep before the next cycle: the base interval doubled per consecutive failure, capped.
    #[must_use]
    pub fn backoff_delay(&self, policy: &RefreshPolicy) -> Duration {
        if self.consecutive_failures == 0 {
            return policy.interval;
        }
        let factor = 2_u32.saturating_pow(self.consecutive_failures);
        policy
            .interval
            .saturating_mul(factor)
            .min(policy.max_backoff.max(policy.interval))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub stale_count: u64,
    pub batch_size: usize,
    pub attempted: usize,
    pub refreshed: usize,
    /// Records the remote rejected or that failed normalization.
    pub skipped: usize,
    /// The remote endpoint itself failed and the cycle stopped early.
    pub aborted: bool,
    /// Shutdown was requested mid-cycle.
    pub interrupted: bool,
}

impl RefreshReport {
    /// Only an unreachable or refusing endpoint fails the cycle. Per-record rejections are skipped.
    #[must_use]
    pub fn is_cycle_failure(&self) -> bool {
        self.aborted
    }
}

/// Runs one incremental refresh cycle against the stalest cached records.
pub async fn refresh_once(
    cache: &dyn ContactCache,
    directory: &dyn RemoteDirectory,
    policy: &RefreshPolicy,
    now: DateTime<Utc>,
    shutdown: &watch::Receiver<bool>,
) -> Result<RefreshReport, CacheStoreError> {
    let stale_before = policy.stale_before(now);
    let stale_count = cache.count_stale(stale_before).await?;
    let batch_size = policy.batch_size_for(stale_count);
    let mut report = RefreshReport {
        stale_count,
        batch_size,
        ..RefreshReport::default()
    };
    if batch_size == 0 {
        tracing::debug!("crm refresh skipped, cache is fresh");
        return Ok(report);
    }

    let candidates = cache.stalest(stale_before, batch_size).await?;
    for (index, cached) in candidates.iter().enumerate() {
        if *shutdown.borrow() {
            report.interrupted = true;
            break;
        }
        if index > 0 && !policy.request_delay.is_zero() {
            tokio::time::sleep(policy.request_delay).await;
        }

        report.attempted += 1;
        let raw = match directory.list_one(&cached.id).await {
            Ok(raw) => raw,
            Err(error) if error.is_endpoint_failure() => {
                tracing::warn!(
                    contact_id = %cached.id,
                    reason = %error,
                    "crm refresh stopped, directory unavailable"
                );
                report.aborted = true;
                break;
            }
            Err(error) => {
                tracing::warn!(contact_id = %cached.id, reason = %error, "crm refresh lookup failed");
                report.skipped += 1;
                continue;
            }
        };

        let fresh = match normalize_contact(&raw, Utc::now()) {
            Ok(fresh) if fresh.id == cached.id => fresh,
            Ok(fresh) => {
                tracing::warn!(
                    contact_id = %cached.id,
                    returned_id = %fresh.id,
                    "crm refresh returned a different contact"
                );
                report.skipped += 1;
                continue;
            }
            Err(error) => {
                tracing::warn!(contact_id = %cached.id, reason = %error, "crm refresh record skipped");
                report.skipped += 1;
                continue;
            }
        };
        cache.upsert_remote(fresh).await?;
        report.refreshed += 1;
    }

    tracing::info!(
        stale_count = report.stale_count,
        batch_size = report.batch_size,
        attempted = report.attempted,
        refreshed = report.refreshed,
        skipped = report.skipped,
        aborted = report.aborted,
        "crm refresh cycle finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use crm_directory::{
        ContactRecord, DirectoryError, DirectoryErrorClass, InMemoryDirectory, SyncStatus,
    };
    use serde_json::json;
    use tokio::sync::watch;

    use super::{RefreshPolicy, SyncState, refresh_once};
    use crate::cache::store::{self as cache_store, ContactCache};

    fn quick_policy() -> RefreshPolicy {
        RefreshPolicy {
            request_delay: Duration::ZERO,
            ..RefreshPolicy::default()
        }
    }

    async fn seed(
        cache: &dyn ContactCache,
        directory: &InMemoryDirectory,
        id: &str,
        hours_ago: Option<i64>,
    ) {
        let mut record = ContactRecord::new(id);
        record.display_name = format!("Cached {id}");
        record.sync_status = SyncStatus::Synced;
        record.last_synced_at = hours_ago.map(|hours| Utc::now() - chrono::Duration::hours(hours));
        cache.upsert(record).await.expect("seed cache");
        directory
            .insert_raw(json!({"ContactId": id, "Name": {"FirstName": "Remote", "LastName": id}}))
            .await;
    }

    #[test]
    fn batch_size_tiers_follow_stale_count() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.batch_size_for(0), 0);
        assert_eq!(policy.batch_size_for(1), 20);
        assert_eq!(policy.batch_size_for(100), 20);
        assert_eq!(policy.batch_size_for(101), 50);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RefreshPolicy::default();
        let mut state = SyncState::default();
        assert_eq!(state.backoff_delay(&policy), Duration::from_secs(60));
        state.record_failure();
        assert_eq!(state.backoff_delay(&policy), Duration::from_secs(120));
        state.record_failure();
        assert_eq!(state.backoff_delay(&policy), Duration::from_secs(240));
        state.record_failure();
        assert_eq!(state.backoff_delay(&policy), Duration::from_secs(300));
        for _ in 0..40 {
            state.record_failure();
        }
        assert_eq!(state.backoff_delay(&policy), Duration::from_secs(300));
        state.record_success();
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.backoff_delay(&policy), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn fresh_cache_makes_no_remote_calls() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        seed(cache.as_ref(), &directory, "1", Some(0)).await;
        let (_tx, shutdown) = watch::channel(false);

        let report = refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        assert_eq!(report.stale_count, 0);
        assert_eq!(report.batch_size, 0);
        assert_eq!(directory.calls().await.total(), 0);
    }

    #[tokio::test]
    async fn bulk_staleness_selects_large_batch_oldest_first() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        for index in 0..30 {
            seed(cache.as_ref(), &directory, &format!("fresh-{index:03}"), Some(0)).await;
        }
        for index in 0..120_i64 {
            seed(
                cache.as_ref(),
                &directory,
                &format!("stale-{index:03}"),
                Some(3 + index),
            )
            .await;
        }
        assert_eq!(cache.count().await.expect("count"), 150);
        let (_tx, shutdown) = watch::channel(false);

        let report = refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        assert_eq!(report.stale_count, 120);
        assert_eq!(report.batch_size, 50);
        assert_eq!(report.refreshed, 50);

        let order = directory.list_one_order().await;
        assert_eq!(order.len(), 50);
        assert_eq!(order.first().map(String::as_str), Some("stale-119"));
        assert_eq!(order.last().map(String::as_str), Some("stale-070"));

        let refreshed = cache.get("stale-119").await.expect("get").expect("cached");
        assert_eq!(refreshed.display_name, "Remote stale-119");
        assert!(refreshed.last_synced_at.is_some_and(|at| at > Utc::now() - chrono::Duration::minutes(1)));
    }

    #[tokio::test]
    async fn never_synced_records_come_first_in_small_batches() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        seed(cache.as_ref(), &directory, "old", Some(5)).await;
        seed(cache.as_ref(), &directory, "never", None).await;
        let (_tx, shutdown) = watch::channel(false);

        let report = refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        assert_eq!(report.batch_size, 20);
        assert_eq!(directory.list_one_order().await, vec!["never", "old"]);
    }

    #[tokio::test]
    async fn embedded_error_does_not_advance_last_synced_at() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        seed(cache.as_ref(), &directory, "7", Some(5)).await;
        let before = cache.get("7").await.expect("get").expect("cached");
        directory
            .fail_record(
                "7",
                DirectoryError::new(DirectoryErrorClass::Envelope, "ErrorCode 123: Invalid contact"),
            )
            .await;
        let (_tx, shutdown) = watch::channel(false);

        let report = refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        assert_eq!(report.refreshed, 0);
        assert_eq!(report.skipped, 1);
        assert!(!report.is_cycle_failure());
        let after = cache.get("7").await.expect("get").expect("cached");
        assert_eq!(after.last_synced_at, before.last_synced_at);
        assert_eq!(after.display_name, "Cached 7");
    }

    #[tokio::test]
    async fn unreachable_directory_aborts_the_cycle() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        seed(cache.as_ref(), &directory, "1", Some(5)).await;
        seed(cache.as_ref(), &directory, "2", Some(6)).await;
        directory.set_unreachable(true).await;
        let (_tx, shutdown) = watch::channel(false);

        let report = refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        assert!(report.aborted);
        assert_eq!(report.attempted, 1);
        assert!(report.is_cycle_failure());
    }

    #[tokio::test]
    async fn remotely_missing_records_are_skipped_without_failing_the_cycle() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        for id in ["gone-1", "gone-2"] {
            let mut record = ContactRecord::new(id);
            record.sync_status = SyncStatus::Synced;
            record.last_synced_at = Some(Utc::now() - chrono::Duration::hours(9));
            cache.upsert(record).await.expect("seed cache");
        }
        let (_tx, shutdown) = watch::channel(false);

        let report = refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.skipped, 2);
        assert!(!report.aborted);
        assert!(!report.is_cycle_failure());
    }

    #[tokio::test]
    async fn pending_local_edits_keep_their_status() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        seed(cache.as_ref(), &directory, "9", Some(5)).await;
        cache
            .set_sync_status("9", SyncStatus::PendingSync)
            .await
            .expect("mark pending");
        let (_tx, shutdown) = watch::channel(false);

        refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        let after = cache.get("9").await.expect("get").expect("cached");
        assert_eq!(after.sync_status, SyncStatus::PendingSync);
    }

    #[tokio::test]
    async fn shutdown_stops_between_records() {
        let cache = cache_store::memory();
        let directory = InMemoryDirectory::default();
        seed(cache.as_ref(), &directory, "1", Some(5)).await;
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).expect("receiver alive");

        let report = refresh_once(
            cache.as_ref(),
            &directory,
            &quick_policy(),
            Utc::now(),
            &shutdown,
        )
        .await
        .expect("refresh");
        assert!(report.interrupted);
        assert_eq!(directory.calls().await.list_one, 0);
    }
}
