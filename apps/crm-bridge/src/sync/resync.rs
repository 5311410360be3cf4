use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use crm_directory::{DirectoryError, RemoteDirectory, normalize_contact, raw_contact_id};
use serde::Serialize;
use serde_json::Value;

use crate::cache::store::{CacheStoreError, ContactCache};

#[derive(Debug, Clone)]
pub struct ResyncConfig {
    /// Hard cap on pages fetched in one run.
    pub max_pages: u32,
    pub page_delay: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            max_pages: 50,
            page_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResyncError {
    #[error("directory page {page} failed: {source}")]
    Directory {
        page: u32,
        #[source]
        source: DirectoryError,
    },
    #[error(transparent)]
    Cache(#[from] CacheStoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub pages_fetched: u32,
    pub records_seen: usize,
    pub unique_records: usize,
    pub upserted: usize,
    pub skipped: usize,
    pub hit_page_cap: bool,
}

/// Rebuilds the cache from a full paged walk of the remote directory.
pub struct FullResyncPaginator {
    directory: Arc<dyn RemoteDirectory>,
    cache: Arc<dyn ContactCache>,
    config: ResyncConfig,
}

impl FullResyncPaginator {
    pub fn new(
        directory: Arc<dyn RemoteDirectory>,
        cache: Arc<dyn ContactCache>,
        config: ResyncConfig,
    ) -> Self {
        Self {
            directory,
            cache,
            config,
        }
    }

    /// Fetches every page, then writes. A failed page leaves the cache untouched.
    pub async fn run(&self) -> Result<ResyncReport, ResyncError> {
        let mut report = ResyncReport::default();
        // Keyed by remote id so overlapping pages collapse; later pages win.
        let mut by_id: BTreeMap<String, Value> = BTreeMap::new();
        let mut page = 1_u32;

        loop {
            if report.pages_fetched >= self.config.max_pages {
                report.hit_page_cap = true;
                tracing::warn!(
                    max_pages = self.config.max_pages,
                    "crm resync stopped at page cap"
                );
                break;
            }
            let fetched = self
                .directory
                .list_all(page)
                .await
                .map_err(|source| ResyncError::Directory { page, source })?;
            report.pages_fetched += 1;
            if fetched.records.is_empty() {
                break;
            }

            report.records_seen += fetched.records.len();
            for raw in fetched.records {
                match raw_contact_id(&raw) {
                    Some(id) => {
                        by_id.insert(id, raw);
                    }
                    None => report.skipped += 1,
                }
            }
            tracing::debug!(page, unique = by_id.len(), "crm resync page fetched");

            match fetched.next_page {
                Some(next) if next != page => page = next,
                _ => break,
            }
            if !self.config.page_delay.is_zero() {
                tokio::time::sleep(self.config.page_delay).await;
            }
        }
        report.unique_records = by_id.len();

        let synced_at = Utc::now();
        let mut records = Vec::with_capacity(by_id.len());
        for (id, raw) in &by_id {
            match normalize_contact(raw, synced_at) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(contact_id = %id, reason = %error, "crm resync record skipped");
                    report.skipped += 1;
                }
            }
        }
        // Rows with a queued local edit keep pending_sync; the check happens inside the write.
        report.upserted = self.cache.upsert_remote_many(records).await?;

        tracing::info!(
            pages = report.pages_fetched,
            seen = report.records_seen,
            unique = report.unique_records,
            upserted = report.upserted,
            skipped = report.skipped,
            hit_page_cap = report.hit_page_cap,
            "crm resync finished"
        );
        Ok(report)
    }
}
