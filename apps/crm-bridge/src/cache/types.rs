use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};
use crm_directory::ContactRecord;
use serde::Serialize;

pub const DEFAULT_SEARCH_LIMIT: usize = 50;
pub const MAX_SEARCH_LIMIT: usize = 500;
/// Records confirmed within this window sort ahead of older ones in search results.
pub const SEARCH_FRESH_WINDOW_HOURS: i64 = 24;

const COMPANY_PLACEHOLDERS: &[&str] = &["", "N/A"];

/// Cache-only contact filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactQuery {
    /// Case-insensitive substring over display name, company, and email.
    pub text: Option<String>,
    /// Case-insensitive substring over company name only.
    pub company: Option<String>,
    pub limit: usize,
}

impl Default for ContactQuery {
    fn default() -> Self {
        Self {
            text: None,
            company: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl ContactQuery {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, MAX_SEARCH_LIMIT)
    }

    pub(crate) fn text_needle(&self) -> Option<String> {
        normalized_needle(self.text.as_deref())
    }

    pub(crate) fn company_needle(&self) -> Option<String> {
        normalized_needle(self.company.as_deref())
    }

    pub(crate) fn matches(&self, record: &ContactRecord) -> bool {
        let text_ok = self.text_needle().is_none_or(|needle| {
            [&record.display_name, &record.company_name, &record.email]
                .iter()
                .any(|field| field.to_lowercase().contains(needle.as_str()))
        });
        let company_ok = self
            .company_needle()
            .is_none_or(|needle| record.company_name.to_lowercase().contains(needle.as_str()));
        text_ok && company_ok
    }
}

fn normalized_needle(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_lowercase)
}

/// Escapes `LIKE` metacharacters and wraps the needle for substring matching.
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut escaped = String::with_capacity(needle.len() + 2);
    escaped.push('%');
    for character in needle.chars() {
        if matches!(character, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(character);
    }
    escaped.push('%');
    escaped
}

pub(crate) fn fresh_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::hours(SEARCH_FRESH_WINDOW_HOURS)
}

/// Search ordering: fresh records first, then display name, then id.
pub(crate) fn search_order(
    left: &ContactRecord,
    right: &ContactRecord,
    cutoff: DateTime<Utc>,
) -> Ordering {
    let outside_window =
        |record: &ContactRecord| record.last_synced_at.is_none_or(|at| at <= cutoff);
    outside_window(left)
        .cmp(&outside_window(right))
        .then_with(|| left.display_name.cmp(&right.display_name))
        .then_with(|| left.id.cmp(&right.id))
}

/// A record is stale when it was never confirmed, was confirmed before the
/// cutoff, or carries a local edit awaiting the remote.
pub(crate) fn is_stale(record: &ContactRecord, stale_before: DateTime<Utc>) -> bool {
    record.sync_status == crm_directory::SyncStatus::PendingSync
        || record.last_synced_at.is_none_or(|at| at < stale_before)
}

pub(crate) fn has_company(record: &ContactRecord) -> bool {
    !COMPANY_PLACEHOLDERS.contains(&record.company_name.trim())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheHealth {
    Excellent,
    Good,
    NeedsRefresh,
}

impl CacheHealth {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::NeedsRefresh => "needs_refresh",
        }
    }

    fn from_fresh_ratio(ratio: f64) -> Self {
        if ratio > 0.9 {
            Self::Excellent
        } else if ratio > 0.7 {
            Self::Good
        } else {
            Self::NeedsRefresh
        }
    }
}

/// Freshness metadata exposed to operators and callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheFreshness {
    pub total: u64,
    pub fresh_last_hour: u64,
    pub fresh_last_day: u64,
    pub pending_sync: u64,
    pub failed: u64,
    pub with_company: u64,
    pub company_coverage_percent: f64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub health: CacheHealth,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct FreshnessCounts {
    pub total: u64,
    pub fresh_last_hour: u64,
    pub fresh_last_day: u64,
    pub pending_sync: u64,
    pub failed: u64,
    pub with_company: u64,
}

impl CacheFreshness {
    pub(crate) fn from_counts(
        counts: FreshnessCounts,
        last_synced_at: Option<DateTime<Utc>>,
    ) -> Self {
        let ratio = |part: u64| {
            if counts.total == 0 {
                0.0
            } else {
                part as f64 / counts.total as f64
            }
        };
        let coverage = (ratio(counts.with_company) * 1_000.0).round() / 10.0;
        Self {
            total: counts.total,
            fresh_last_hour: counts.fresh_last_hour,
            fresh_last_day: counts.fresh_last_day,
            pending_sync: counts.pending_sync,
            failed: counts.failed,
            with_company: counts.with_company,
            company_coverage_percent: coverage,
            last_synced_at,
            health: CacheHealth::from_fresh_ratio(ratio(counts.fresh_last_day)),
        }
    }
}
