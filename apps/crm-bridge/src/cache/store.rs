use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use crm_directory::{ContactAddress, ContactRecord, SyncStatus};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::GenericClient;

use crate::cache::types::{
    CacheFreshness, ContactQuery, FreshnessCounts, fresh_cutoff, has_company, is_stale,
    like_pattern, search_order,
};
use crate::db::BridgeDb;

#[derive(Debug, thiserror::Error)]
pub enum CacheStoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("db error: {0}")]
    Db(String),
}

/// Local contact store. Every operation is local; nothing here waits on the remote directory.
#[async_trait]
pub trait ContactCache: Send + Sync {
    /// Merges `record` into the cache and returns the stored result.
    async fn upsert(&self, record: ContactRecord) -> Result<ContactRecord, CacheStoreError>;

    async fn upsert_many(&self, records: Vec<ContactRecord>) -> Result<usize, CacheStoreError>;

    /// Merges a record fetched from the remote directory. A row that is
    /// `pending_sync` at write time stays `pending_sync` until the drain loop settles it.
    async fn upsert_remote(&self, record: ContactRecord) -> Result<ContactRecord, CacheStoreError>;

    async fn upsert_remote_many(
        &self,
        records: Vec<ContactRecord>,
    ) -> Result<usize, CacheStoreError>;

    async fn get(&self, contact_id: &str) -> Result<Option<ContactRecord>, CacheStoreError>;

    async fn search(
        &self,
        query: &ContactQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContactRecord>, CacheStoreError>;

    async fn count(&self) -> Result<u64, CacheStoreError>;

    async fn count_stale(&self, stale_before: DateTime<Utc>) -> Result<u64, CacheStoreError>;

    /// Stale records with remote ids, least recently synced first (never-synced first of all).
    async fn stalest(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContactRecord>, CacheStoreError>;

    /// Moves a locally created record to its remote-issued id and merges `remote` onto it.
    async fn rekey(
        &self,
        temporary_id: &str,
        remote: ContactRecord,
    ) -> Result<ContactRecord, CacheStoreError>;

    async fn set_sync_status(
        &self,
        contact_id: &str,
        status: SyncStatus,
    ) -> Result<(), CacheStoreError>;

    async fn freshness(&self, now: DateTime<Utc>) -> Result<CacheFreshness, CacheStoreError>;
}

pub fn memory() -> Arc<dyn ContactCache> {
    Arc::new(MemoryContactCache::default())
}

pub fn postgres(db: Arc<BridgeDb>) -> Arc<dyn ContactCache> {
    Arc::new(PostgresContactCache { db })
}

#[derive(Default)]
struct MemoryContactCache {
    inner: Mutex<HashMap<String, ContactRecord>>,
}

fn merge_into(records: &mut HashMap<String, ContactRecord>, record: ContactRecord) -> ContactRecord {
    let entry = records
        .entry(record.id.clone())
        .or_insert_with(|| ContactRecord::new(record.id.clone()));
    entry.merge_from(&record);
    entry.clone()
}

fn merge_remote_into(
    records: &mut HashMap<String, ContactRecord>,
    mut record: ContactRecord,
) -> ContactRecord {
    if records
        .get(&record.id)
        .is_some_and(|current| current.sync_status == SyncStatus::PendingSync)
    {
        record.sync_status = SyncStatus::PendingSync;
    }
    merge_into(records, record)
}

#[async_trait]
impl ContactCache for MemoryContactCache {
    async fn upsert(&self, record: ContactRecord) -> Result<ContactRecord, CacheStoreError> {
        let mut inner = self.inner.lock().await;
        Ok(merge_into(&mut inner, record))
    }

    async fn upsert_many(&self, records: Vec<ContactRecord>) -> Result<usize, CacheStoreError> {
        let mut inner = self.inner.lock().await;
        let count = records.len();
        for record in records {
            merge_into(&mut inner, record);
        }
        Ok(count)
    }

    async fn upsert_remote(&self, record: ContactRecord) -> Result<ContactRecord, CacheStoreError> {
        let mut inner = self.inner.lock().await;
        Ok(merge_remote_into(&mut inner, record))
    }

    async fn upsert_remote_many(
        &self,
        records: Vec<ContactRecord>,
    ) -> Result<usize, CacheStoreError> {
        let mut inner = self.inner.lock().await;
        let count = records.len();
        for record in records {
            merge_remote_into(&mut inner, record);
        }
        Ok(count)
    }

    async fn get(&self, contact_id: &str) -> Result<Option<ContactRecord>, CacheStoreError> {
        Ok(self.inner.lock().await.get(contact_id).cloned())
    }

    async fn search(
        &self,
        query: &ContactQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContactRecord>, CacheStoreError> {
        let cutoff = fresh_cutoff(now);
        let inner = self.inner.lock().await;
        let mut matches: Vec<ContactRecord> = inner
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        drop(inner);
        matches.sort_by(|left, right| search_order(left, right, cutoff));
        matches.truncate(query.effective_limit());
        Ok(matches)
    }

    async fn count(&self) -> Result<u64, CacheStoreError> {
        Ok(self.inner.lock().await.len() as u64)
    }

    async fn count_stale(&self, stale_before: DateTime<Utc>) -> Result<u64, CacheStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .values()
            .filter(|record| is_stale(record, stale_before))
            .count() as u64)
    }

    async fn stalest(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContactRecord>, CacheStoreError> {
        let inner = self.inner.lock().await;
        let mut candidates: Vec<ContactRecord> = inner
            .values()
            .filter(|record| !record.has_temporary_id() && is_stale(record, stale_before))
            .cloned()
            .collect();
        drop(inner);
        // None sorts before Some, which gives never-synced records priority.
        candidates.sort_by(|left, right| {
            left.last_synced_at
                .cmp(&right.last_synced_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn rekey(
        &self,
        temporary_id: &str,
        remote: ContactRecord,
    ) -> Result<ContactRecord, CacheStoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(mut local) = inner.remove(temporary_id) {
            local.id.clone_from(&remote.id);
            merge_into(&mut inner, local);
        }
        Ok(merge_into(&mut inner, remote))
    }

    async fn set_sync_status(
        &self,
        contact_id: &str,
        status: SyncStatus,
    ) -> Result<(), CacheStoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .get_mut(contact_id)
            .ok_or_else(|| CacheStoreError::NotFound(format!("contact {contact_id}")))?;
        record.sync_status = status;
        Ok(())
    }

    async fn freshness(&self, now: DateTime<Utc>) -> Result<CacheFreshness, CacheStoreError> {
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::hours(24);
        let inner = self.inner.lock().await;
        let mut counts = FreshnessCounts::default();
        let mut last_synced_at: Option<DateTime<Utc>> = None;
        for record in inner.values() {
            counts.total += 1;
            if let Some(at) = record.last_synced_at {
                counts.fresh_last_hour += u64::from(at > hour_ago);
                counts.fresh_last_day += u64::from(at > day_ago);
                last_synced_at = last_synced_at.max(Some(at));
            }
            counts.pending_sync += u64::from(record.sync_status == SyncStatus::PendingSync);
            counts.failed += u64::from(record.sync_status == SyncStatus::Failed);
            counts.with_company += u64::from(has_company(record));
        }
        Ok(CacheFreshness::from_counts(counts, last_synced_at))
    }
}

struct PostgresContactCache {
    db: Arc<BridgeDb>,
}

impl PostgresContactCache {
    async fn upsert_batch(
        &self,
        records: &[ContactRecord],
        source: MergeSource,
    ) -> Result<usize, CacheStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        for record in records {
            upsert_contact(&tx, record, source).await?;
        }
        tx.commit()
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        Ok(records.len())
    }
}

const CONTACT_COLUMNS: &str = "contact_id, display_name, first_name, last_name, company_name, \
     email, phone, address, custom_fields, sync_status, last_synced_at";

const STALE_PREDICATE: &str =
    "(last_synced_at IS NULL OR last_synced_at < $1 OR sync_status = 'pending_sync')";

const UPSERT_CONTACT_SQL: &str = r#"
    INSERT INTO crm_contacts_cache (
        contact_id, display_name, first_name, last_name, company_name, email, phone,
        address, custom_fields, sync_status, last_synced_at, updated_at
    ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11, now())
    ON CONFLICT (contact_id) DO UPDATE SET
        display_name = COALESCE(NULLIF(EXCLUDED.display_name, ''), crm_contacts_cache.display_name),
        first_name = COALESCE(NULLIF(EXCLUDED.first_name, ''), crm_contacts_cache.first_name),
        last_name = COALESCE(NULLIF(EXCLUDED.last_name, ''), crm_contacts_cache.last_name),
        company_name = COALESCE(NULLIF(EXCLUDED.company_name, ''), crm_contacts_cache.company_name),
        email = COALESCE(NULLIF(EXCLUDED.email, ''), crm_contacts_cache.email),
        phone = COALESCE(NULLIF(EXCLUDED.phone, ''), crm_contacts_cache.phone),
        address = COALESCE(EXCLUDED.address, crm_contacts_cache.address),
        custom_fields = crm_contacts_cache.custom_fields || EXCLUDED.custom_fields,
        sync_status = CASE
            WHEN $12 AND crm_contacts_cache.sync_status = 'pending_sync' THEN 'pending_sync'
            ELSE EXCLUDED.sync_status
        END,
        last_synced_at = EXCLUDED.last_synced_at,
        updated_at = now()
    RETURNING contact_id, display_name, first_name, last_name, company_name,
              email, phone, address, custom_fields, sync_status, last_synced_at
"#;

/// Where an upserted record came from. Remote data never clears a pending local edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeSource {
    Local,
    Remote,
}

/// Applies the cache merge rule in a single statement on any client or transaction.
pub(crate) async fn upsert_contact<C>(
    client: &C,
    record: &ContactRecord,
    source: MergeSource,
) -> Result<ContactRecord, CacheStoreError>
where
    C: GenericClient + Sync,
{
    let address = record
        .address
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|error| CacheStoreError::Db(error.to_string()))?;
    let custom_fields = serde_json::to_value(&record.custom_fields)
        .map_err(|error| CacheStoreError::Db(error.to_string()))?;
    let sync_status = record.sync_status.as_str();
    let keep_pending = source == MergeSource::Remote;

    let row = client
        .query_one(
            UPSERT_CONTACT_SQL,
            &[
                &record.id,
                &record.display_name,
                &record.first_name,
                &record.last_name,
                &record.company_name,
                &record.email,
                &record.phone,
                &address,
                &custom_fields,
                &sync_status,
                &record.last_synced_at,
                &keep_pending,
            ],
        )
        .await
        .map_err(|error| CacheStoreError::Db(error.to_string()))?;
    map_contact_row(&row).map_err(CacheStoreError::Db)
}

#[async_trait]
impl ContactCache for PostgresContactCache {
    async fn upsert(&self, record: ContactRecord) -> Result<ContactRecord, CacheStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        upsert_contact(&*client, &record, MergeSource::Local).await
    }

    async fn upsert_many(&self, records: Vec<ContactRecord>) -> Result<usize, CacheStoreError> {
        self.upsert_batch(&records, MergeSource::Local).await
    }

    async fn upsert_remote(&self, record: ContactRecord) -> Result<ContactRecord, CacheStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        upsert_contact(&*client, &record, MergeSource::Remote).await
    }

    async fn upsert_remote_many(
        &self,
        records: Vec<ContactRecord>,
    ) -> Result<usize, CacheStoreError> {
        self.upsert_batch(&records, MergeSource::Remote).await
    }

    async fn get(&self, contact_id: &str) -> Result<Option<ContactRecord>, CacheStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_opt(
                format!("SELECT {CONTACT_COLUMNS} FROM crm_contacts_cache WHERE contact_id = $1")
                    .as_str(),
                &[&contact_id],
            )
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        row.as_ref()
            .map(map_contact_row)
            .transpose()
            .map_err(CacheStoreError::Db)
    }

    async fn search(
        &self,
        query: &ContactQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<ContactRecord>, CacheStoreError> {
        let text_pattern = query.text_needle().map(|needle| like_pattern(&needle));
        let company_pattern = query.company_needle().map(|needle| like_pattern(&needle));
        let cutoff = fresh_cutoff(now);
        let limit = query.effective_limit() as i64;

        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                format!(
                    r#"
                    SELECT {CONTACT_COLUMNS}
                      FROM crm_contacts_cache
                     WHERE ($1::text IS NULL
                            OR display_name ILIKE $1
                            OR company_name ILIKE $1
                            OR email ILIKE $1)
                       AND ($2::text IS NULL OR company_name ILIKE $2)
                     ORDER BY CASE WHEN last_synced_at > $3 THEN 0 ELSE 1 END,
                              display_name COLLATE "C",
                              contact_id COLLATE "C"
                     LIMIT $4
                    "#
                )
                .as_str(),
                &[&text_pattern, &company_pattern, &cutoff, &limit],
            )
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_contact_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CacheStoreError::Db)
    }

    async fn count(&self) -> Result<u64, CacheStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one("SELECT COUNT(*) AS total FROM crm_contacts_cache", &[])
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        read_count(&row, "total")
    }

    async fn count_stale(&self, stale_before: DateTime<Utc>) -> Result<u64, CacheStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                format!("SELECT COUNT(*) AS stale FROM crm_contacts_cache WHERE {STALE_PREDICATE}")
                    .as_str(),
                &[&stale_before],
            )
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        read_count(&row, "stale")
    }

    async fn stalest(
        &self,
        stale_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ContactRecord>, CacheStoreError> {
        let limit = limit as i64;
        let client = self.db.client();
        let client = client.lock().await;
        let rows = client
            .query(
                format!(
                    r#"
                    SELECT {CONTACT_COLUMNS}
                      FROM crm_contacts_cache
                     WHERE {STALE_PREDICATE}
                       AND contact_id NOT LIKE 'TEMP\_%'
                     ORDER BY last_synced_at ASC NULLS FIRST, contact_id COLLATE "C"
                     LIMIT $2
                    "#
                )
                .as_str(),
                &[&stale_before, &limit],
            )
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        rows.iter()
            .map(map_contact_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(CacheStoreError::Db)
    }

    async fn rekey(
        &self,
        temporary_id: &str,
        remote: ContactRecord,
    ) -> Result<ContactRecord, CacheStoreError> {
        let client = self.db.client();
        let mut client = client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;

        let local = tx
            .query_opt(
                format!(
                    "DELETE FROM crm_contacts_cache WHERE contact_id = $1 RETURNING {CONTACT_COLUMNS}"
                )
                .as_str(),
                &[&temporary_id],
            )
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        if let Some(row) = local {
            let mut local = map_contact_row(&row).map_err(CacheStoreError::Db)?;
            local.id.clone_from(&remote.id);
            upsert_contact(&tx, &local, MergeSource::Local).await?;
        }
        let merged = upsert_contact(&tx, &remote, MergeSource::Local).await?;

        tx.commit()
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        Ok(merged)
    }

    async fn set_sync_status(
        &self,
        contact_id: &str,
        status: SyncStatus,
    ) -> Result<(), CacheStoreError> {
        let client = self.db.client();
        let client = client.lock().await;
        let updated = client
            .execute(
                r#"
                UPDATE crm_contacts_cache
                   SET sync_status = $2, updated_at = now()
                 WHERE contact_id = $1
                "#,
                &[&contact_id, &status.as_str()],
            )
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        if updated == 0 {
            return Err(CacheStoreError::NotFound(format!("contact {contact_id}")));
        }
        Ok(())
    }

    async fn freshness(&self, now: DateTime<Utc>) -> Result<CacheFreshness, CacheStoreError> {
        let hour_ago = now - Duration::hours(1);
        let day_ago = now - Duration::hours(24);
        let client = self.db.client();
        let client = client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT COUNT(*) AS total,
                       COUNT(*) FILTER (WHERE last_synced_at > $1) AS fresh_last_hour,
                       COUNT(*) FILTER (WHERE last_synced_at > $2) AS fresh_last_day,
                       COUNT(*) FILTER (WHERE sync_status = 'pending_sync') AS pending_sync,
                       COUNT(*) FILTER (WHERE sync_status = 'failed') AS failed,
                       COUNT(*) FILTER (WHERE btrim(company_name) NOT IN ('', 'N/A')) AS with_company,
                       MAX(last_synced_at) AS last_synced_at
                  FROM crm_contacts_cache
                "#,
                &[&hour_ago, &day_ago],
            )
            .await
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;

        let counts = FreshnessCounts {
            total: read_count(&row, "total")?,
            fresh_last_hour: read_count(&row, "fresh_last_hour")?,
            fresh_last_day: read_count(&row, "fresh_last_day")?,
            pending_sync: read_count(&row, "pending_sync")?,
            failed: read_count(&row, "failed")?,
            with_company: read_count(&row, "with_company")?,
        };
        let last_synced_at: Option<DateTime<Utc>> = row
            .try_get("last_synced_at")
            .map_err(|error| CacheStoreError::Db(error.to_string()))?;
        Ok(CacheFreshness::from_counts(counts, last_synced_at))
    }
}

fn read_count(row: &tokio_postgres::Row, column: &str) -> Result<u64, CacheStoreError> {
    let value: i64 = row
        .try_get(column)
        .map_err(|error| CacheStoreError::Db(error.to_string()))?;
    Ok(value.max(0) as u64)
}

fn map_contact_row(row: &tokio_postgres::Row) -> Result<ContactRecord, String> {
    let address: Option<Value> = row.try_get("address").map_err(|e| e.to_string())?;
    let address = address
        .filter(|value| !value.is_null())
        .map(serde_json::from_value::<ContactAddress>)
        .transpose()
        .map_err(|e| e.to_string())?;
    let custom_fields: Value = row.try_get("custom_fields").map_err(|e| e.to_string())?;
    let custom_fields =
        serde_json::from_value::<BTreeMap<String, Value>>(custom_fields).map_err(|e| e.to_string())?;
    let sync_status: String = row.try_get("sync_status").map_err(|e| e.to_string())?;

    Ok(ContactRecord {
        id: row.try_get("contact_id").map_err(|e| e.to_string())?,
        display_name: row.try_get("display_name").map_err(|e| e.to_string())?,
        first_name: row.try_get("first_name").map_err(|e| e.to_string())?,
        last_name: row.try_get("last_name").map_err(|e| e.to_string())?,
        company_name: row.try_get("company_name").map_err(|e| e.to_string())?,
        email: row.try_get("email").map_err(|e| e.to_string())?,
        phone: row.try_get("phone").map_err(|e| e.to_string())?,
        address,
        custom_fields,
        sync_status: SyncStatus::parse(&sync_status)
            .ok_or_else(|| format!("unknown sync_status {sync_status}"))?,
        last_synced_at: row.try_get("last_synced_at").map_err(|e| e.to_string())?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use crm_directory::{ContactAddress, ContactRecord, SyncStatus};
    use serde_json::json;

    use super::memory;
    use crate::cache::types::ContactQuery;

    fn contact(id: &str, name: &str, last_synced_hours_ago: Option<i64>) -> ContactRecord {
        let now = Utc::now();
        ContactRecord {
            id: id.to_string(),
            display_name: name.to_string(),
            sync_status: SyncStatus::Synced,
            last_synced_at: last_synced_hours_ago.map(|hours| now - Duration::hours(hours)),
            ..ContactRecord::default()
        }
    }

    #[tokio::test]
    async fn upsert_merges_and_is_idempotent() {
        let cache = memory();
        let mut record = contact("1", "Ada", Some(0));
        record.email = "ada@example.com".to_string();
        record.custom_fields.insert("tier".to_string(), json!("gold"));

        let first = cache.upsert(record.clone()).await.expect("first upsert");
        let second = cache.upsert(record.clone()).await.expect("second upsert");
        assert_eq!(first, second);

        let partial = ContactRecord {
            id: "1".to_string(),
            phone: "555-0100".to_string(),
            sync_status: SyncStatus::PendingSync,
            ..ContactRecord::default()
        };
        let merged = cache.upsert(partial).await.expect("partial upsert");
        assert_eq!(merged.email, "ada@example.com");
        assert_eq!(merged.phone, "555-0100");
        assert_eq!(merged.sync_status, SyncStatus::PendingSync);
        assert_eq!(merged.last_synced_at, None);
        assert_eq!(merged.custom_fields.get("tier"), Some(&json!("gold")));
    }

    #[tokio::test]
    async fn search_puts_recently_synced_first_then_orders_by_name() {
        let cache = memory();
        cache
            .upsert_many(vec![
                contact("1", "Zed Fuel", Some(1)),
                contact("2", "Alpha Fuel", Some(48)),
                contact("3", "Beta Fuel", Some(2)),
                contact("4", "Aaron Fuel", None),
                contact("5", "Unrelated", Some(1)),
            ])
            .await
            .expect("seed");

        let results = cache
            .search(&ContactQuery::text("fuel"), Utc::now())
            .await
            .expect("search");
        let ids: Vec<&str> = results.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["3", "1", "4", "2"]);

        let limited = cache
            .search(&ContactQuery::text("fuel").with_limit(2), Utc::now())
            .await
            .expect("search");
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn stale_queries_rank_never_synced_first_and_skip_temporary_ids() {
        let cache = memory();
        let mut pending = contact("TEMP_20260101_000000_0000abcd", "Pending", None);
        pending.sync_status = SyncStatus::PendingSync;
        cache
            .upsert_many(vec![
                contact("10", "Fresh", Some(1)),
                contact("11", "Old", Some(5)),
                contact("12", "Older", Some(9)),
                contact("13", "Never", None),
                pending,
            ])
            .await
            .expect("seed");

        let cutoff = Utc::now() - Duration::hours(2);
        assert_eq!(cache.count_stale(cutoff).await.expect("count"), 4);

        let stalest = cache.stalest(cutoff, 10).await.expect("stalest");
        let ids: Vec<&str> = stalest.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["13", "12", "11"]);
        assert_eq!(cache.stalest(cutoff, 1).await.expect("stalest").len(), 1);
    }

    #[tokio::test]
    async fn rekey_moves_local_record_to_remote_id() {
        let cache = memory();
        let mut local = contact("TEMP_20260101_000000_00000001", "New Prospect", None);
        local.sync_status = SyncStatus::PendingSync;
        local.address = Some(ContactAddress {
            city: "Tulsa".to_string(),
            ..ContactAddress::default()
        });
        cache.upsert(local.clone()).await.expect("seed");

        let mut remote = local.clone();
        remote.id = "5000".to_string();
        remote.sync_status = SyncStatus::Synced;
        remote.last_synced_at = Some(Utc::now());
        let merged = cache
            .rekey("TEMP_20260101_000000_00000001", remote)
            .await
            .expect("rekey");

        assert_eq!(merged.id, "5000");
        assert_eq!(merged.sync_status, SyncStatus::Synced);
        assert_eq!(merged.address, local.address);
        assert!(
            cache
                .get("TEMP_20260101_000000_00000001")
                .await
                .expect("get")
                .is_none()
        );
        assert_eq!(cache.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn freshness_reports_counts_and_health() {
        let cache = memory();
        let mut with_company = contact("1", "A", Some(0));
        with_company.company_name = "Fuel Co".to_string();
        let mut placeholder = contact("2", "B", Some(3));
        placeholder.company_name = "N/A".to_string();
        let mut failed = contact("3", "C", None);
        failed.sync_status = SyncStatus::Failed;
        cache
            .upsert_many(vec![with_company, placeholder, failed])
            .await
            .expect("seed");

        let report = cache.freshness(Utc::now()).await.expect("freshness");
        assert_eq!(report.total, 3);
        assert_eq!(report.fresh_last_hour, 1);
        assert_eq!(report.fresh_last_day, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.with_company, 1);
        assert!(report.last_synced_at.is_some());
        assert_eq!(report.health.as_str(), "needs_refresh");
    }

    #[tokio::test]
    async fn remote_data_keeps_a_pending_status_until_it_is_settled() {
        let cache = memory();
        let mut local = contact("1", "Local Edit", Some(5));
        local.sync_status = SyncStatus::PendingSync;
        cache.upsert(local).await.expect("seed");

        let remote = contact("1", "Remote Name", Some(0));
        let merged = cache.upsert_remote(remote.clone()).await.expect("remote upsert");
        assert_eq!(merged.sync_status, SyncStatus::PendingSync);
        assert_eq!(merged.last_synced_at, remote.last_synced_at);

        cache
            .set_sync_status("1", SyncStatus::Synced)
            .await
            .expect("settle");
        let merged = cache.upsert_remote(remote).await.expect("remote upsert");
        assert_eq!(merged.sync_status, SyncStatus::Synced);

        let written = cache
            .upsert_remote_many(vec![contact("2", "Fresh", Some(0))])
            .await
            .expect("remote batch");
        assert_eq!(written, 1);
        let fresh = cache.get("2").await.expect("get").expect("present");
        assert_eq!(fresh.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn set_sync_status_requires_existing_contact() {
        let cache = memory();
        assert!(cache.set_sync_status("missing", SyncStatus::Failed).await.is_err());
        cache.upsert(contact("1", "A", Some(0))).await.expect("seed");
        cache
            .set_sync_status("1", SyncStatus::Failed)
            .await
            .expect("status update");
        let record = cache.get("1").await.expect("get").expect("present");
        assert_eq!(record.sync_status, SyncStatus::Failed);
    }
}
