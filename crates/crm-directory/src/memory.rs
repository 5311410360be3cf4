//! In-process [`RemoteDirectory`] with scripted failures.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::{
    DirectoryError, DirectoryErrorClass, DirectoryPage, RemoteDirectory, contact_parameters,
};
use crate::types::ContactRecord;

const FIRST_REMOTE_ID: u64 = 5_000;

/// Number of calls served per directory function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryCallCounts {
    pub list_all: u64,
    pub list_one: u64,
    pub create: u64,
    pub update: u64,
}

impl DirectoryCallCounts {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.list_all
            .saturating_add(self.list_one)
            .saturating_add(self.create)
            .saturating_add(self.update)
    }
}

pub struct InMemoryDirectory {
    inner: Mutex<InMemoryDirectoryInner>,
}

struct InMemoryDirectoryInner {
    contacts: BTreeMap<String, Value>,
    page_size: usize,
    page_overlap: usize,
    repeat_last_page: bool,
    unreachable: bool,
    next_remote_id: u64,
    record_failures: HashMap<String, DirectoryError>,
    page_failures: HashMap<u32, DirectoryError>,
    queued_failures: VecDeque<DirectoryError>,
    list_one_order: Vec<String>,
    calls: DirectoryCallCounts,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::with_page_size(100)
    }
}

impl InMemoryDirectory {
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            inner: Mutex::new(InMemoryDirectoryInner {
                contacts: BTreeMap::new(),
                page_size: page_size.max(1),
                page_overlap: 0,
                repeat_last_page: false,
                unreachable: false,
                next_remote_id: FIRST_REMOTE_ID,
                record_failures: HashMap::new(),
                page_failures: HashMap::new(),
                queued_failures: VecDeque::new(),
                list_one_order: Vec::new(),
                calls: DirectoryCallCounts::default(),
            }),
        }
    }

    /// Stores a raw remote payload keyed by its `ContactId`.
    pub async fn insert_raw(&self, raw: Value) {
        let id = crate::normalize::raw_contact_id(&raw).unwrap_or_default();
        self.inner.lock().await.contacts.insert(id, raw);
    }

    pub async fn get_raw(&self, contact_id: &str) -> Option<Value> {
        self.inner.lock().await.contacts.get(contact_id).cloned()
    }

    /// Each page after the first starts `overlap` records before the previous page ended.
    pub async fn set_page_overlap(&self, overlap: usize) {
        self.inner.lock().await.page_overlap = overlap;
    }

    /// Pages past the end return the last page again instead of an empty page.
    pub async fn set_repeat_last_page(&self, repeat: bool) {
        self.inner.lock().await.repeat_last_page = repeat;
    }

    /// Every call fails with a network error while set.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().await.unreachable = unreachable;
    }

    /// `list_one` for this id fails with `error` until cleared.
    pub async fn fail_record(&self, contact_id: &str, error: DirectoryError) {
        self.inner
            .lock()
            .await
            .record_failures
            .insert(contact_id.to_string(), error);
    }

    pub async fn clear_record_failure(&self, contact_id: &str) {
        self.inner.lock().await.record_failures.remove(contact_id);
    }

    /// `list_all` for this page fails with `error` until cleared.
    pub async fn fail_page(&self, page: u32, error: DirectoryError) {
        self.inner.lock().await.page_failures.insert(page, error);
    }

    /// The next call of any kind fails with `error`.
    pub async fn fail_next(&self, error: DirectoryError) {
        self.inner.lock().await.queued_failures.push_back(error);
    }

    pub async fn calls(&self) -> DirectoryCallCounts {
        self.inner.lock().await.calls
    }

    /// Ids requested through `list_one`, in call order.
    pub async fn list_one_order(&self) -> Vec<String> {
        self.inner.lock().await.list_one_order.clone()
    }
}

impl InMemoryDirectoryInner {
    fn check_available(&mut self) -> Result<(), DirectoryError> {
        if self.unreachable {
            return Err(DirectoryError::new(
                DirectoryErrorClass::Network,
                "connection refused",
            ));
        }
        match self.queued_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn page(&self, page: u32) -> Vec<Value> {
        let all: Vec<&Value> = self.contacts.values().collect();
        let index = page.saturating_sub(1) as usize;
        let mut start = index.saturating_mul(self.page_size);
        if index > 0 {
            start = start.saturating_sub(self.page_overlap);
        }
        if start >= all.len() && self.repeat_last_page && !all.is_empty() {
            start = all.len().saturating_sub(self.page_size);
        }
        let end = start.saturating_add(self.page_size).min(all.len());
        all.get(start..end)
            .map(|slice| slice.iter().map(|value| (*value).clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteDirectory for InMemoryDirectory {
    async fn list_all(&self, page: u32) -> Result<DirectoryPage, DirectoryError> {
        let mut inner = self.inner.lock().await;
        inner.calls.list_all = inner.calls.list_all.saturating_add(1);
        inner.check_available()?;
        if let Some(error) = inner.page_failures.get(&page) {
            return Err(error.clone());
        }
        Ok(DirectoryPage {
            records: inner.page(page),
            next_page: Some(page.saturating_add(1)),
        })
    }

    async fn list_one(&self, contact_id: &str) -> Result<Value, DirectoryError> {
        let mut inner = self.inner.lock().await;
        inner.calls.list_one = inner.calls.list_one.saturating_add(1);
        inner.list_one_order.push(contact_id.to_string());
        inner.check_available()?;
        if let Some(error) = inner.record_failures.get(contact_id) {
            return Err(error.clone());
        }
        inner.contacts.get(contact_id).cloned().ok_or_else(|| {
            DirectoryError::new(
                DirectoryErrorClass::Validation,
                format!("contact {contact_id} not found"),
            )
        })
    }

    async fn create(&self, record: &ContactRecord) -> Result<String, DirectoryError> {
        let mut inner = self.inner.lock().await;
        inner.calls.create = inner.calls.create.saturating_add(1);
        inner.check_available()?;
        let remote_id = inner.next_remote_id.to_string();
        inner.next_remote_id = inner.next_remote_id.saturating_add(1);
        let mut raw = contact_parameters(record);
        if let Value::Object(object) = &mut raw {
            object.insert("ContactId".to_string(), Value::String(remote_id.clone()));
        }
        inner.contacts.insert(remote_id.clone(), raw);
        Ok(remote_id)
    }

    async fn update(&self, record: &ContactRecord) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().await;
        inner.calls.update = inner.calls.update.saturating_add(1);
        inner.check_available()?;
        if !inner.contacts.contains_key(&record.id) {
            return Err(DirectoryError::new(
                DirectoryErrorClass::Validation,
                format!("contact {} not found", record.id),
            ));
        }
        let mut raw = contact_parameters(record);
        if let Value::Object(object) = &mut raw {
            object.insert("ContactId".to_string(), Value::String(record.id.clone()));
        }
        inner.contacts.insert(record.id.clone(), raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn seeded(count: usize, page_size: usize) -> InMemoryDirectory {
        let directory = InMemoryDirectory::with_page_size(page_size);
        for index in 0..count {
            directory
                .insert_raw(json!({"ContactId": format!("{index:04}"), "Name": format!("Contact {index}")}))
                .await;
        }
        directory
    }

    #[tokio::test]
    async fn pages_walk_records_and_end_with_an_empty_page() {
        let directory = seeded(5, 2).await;
        assert_eq!(directory.list_all(1).await.expect("page 1").records.len(), 2);
        assert_eq!(directory.list_all(3).await.expect("page 3").records.len(), 1);
        assert!(directory.list_all(4).await.expect("page 4").records.is_empty());
        assert_eq!(directory.calls().await.list_all, 3);
    }

    #[tokio::test]
    async fn overlapping_pages_repeat_records() {
        let directory = seeded(4, 2).await;
        directory.set_page_overlap(1).await;
        let second = directory.list_all(2).await.expect("page 2");
        assert_eq!(second.records[0]["ContactId"], json!("0001"));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let directory = seeded(1, 10).await;
        directory
            .fail_next(DirectoryError::new(DirectoryErrorClass::Network, "boom"))
            .await;
        assert!(directory.list_one("0000").await.is_err());
        assert!(directory.list_one("0000").await.is_ok());
    }

    #[tokio::test]
    async fn created_contacts_are_listed_with_remote_ids() {
        let directory = InMemoryDirectory::default();
        let mut record = ContactRecord::new("TEMP_1");
        record.display_name = "Fresh Prospect".to_string();
        let remote_id = directory.create(&record).await.expect("create");
        assert_eq!(remote_id, "5000");
        let raw = directory.get_raw("5000").await.expect("stored");
        assert_eq!(raw["Name"], json!("Fresh Prospect"));
    }
}
