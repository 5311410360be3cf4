//! Canonical contact shapes shared by the cache, the write queue, and the directory client.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const TEMPORARY_ID_PREFIX: &str = "TEMP_";

/// Reconciliation state of a cached contact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    PendingSync,
    Synced,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingSync => "pending_sync",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pending_sync" => Some(Self::PendingSync),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Structured postal address. Absence is modelled as `Option<ContactAddress>`,
/// never as an all-empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactAddress {
    #[serde(default)]
    pub street: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub postal_code: String,
    #[serde(default)]
    pub country: String,
}

impl ContactAddress {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.street.is_empty()
            && self.city.is_empty()
            && self.state.is_empty()
            && self.postal_code.is_empty()
            && self.country.is_empty()
    }
}

/// Canonical cached contact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: Option<ContactAddress>,
    #[serde(default)]
    pub custom_fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ContactRecord {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_temporary_id(&self) -> bool {
        is_temporary_id(&self.id)
    }

    /// Field-wise merge of `incoming` onto `self`.
    ///
    /// Non-empty incoming strings overwrite, empty ones leave the current value
    /// alone. An incoming address replaces the stored one as a unit. Custom
    /// fields merge per key. Sync status and last-synced time always take the
    /// incoming values. The id is never touched.
    pub fn merge_from(&mut self, incoming: &ContactRecord) {
        overwrite_non_empty(&mut self.display_name, &incoming.display_name);
        overwrite_non_empty(&mut self.first_name, &incoming.first_name);
        overwrite_non_empty(&mut self.last_name, &incoming.last_name);
        overwrite_non_empty(&mut self.company_name, &incoming.company_name);
        overwrite_non_empty(&mut self.email, &incoming.email);
        overwrite_non_empty(&mut self.phone, &incoming.phone);
        if let Some(address) = incoming.address.as_ref() {
            self.address = Some(address.clone());
        }
        for (key, value) in &incoming.custom_fields {
            self.custom_fields.insert(key.clone(), value.clone());
        }
        self.sync_status = incoming.sync_status;
        self.last_synced_at = incoming.last_synced_at;
    }
}

fn overwrite_non_empty(current: &mut String, incoming: &str) {
    if !incoming.is_empty() {
        incoming.clone_into(current);
    }
}

/// Generates a local identifier for a contact that has not been created remotely yet.
#[must_use]
pub fn new_temporary_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().as_u128() as u32;
    format!(
        "{TEMPORARY_ID_PREFIX}{}_{suffix:08x}",
        now.format("%Y%m%d_%H%M%S")
    )
}

#[must_use]
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMPORARY_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn synced_record() -> ContactRecord {
        ContactRecord {
            id: "1001".to_string(),
            display_name: "Ada Lovelace".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            company_name: "Analytical Engines".to_string(),
            email: "ada@example.com".to_string(),
            phone: "555-0100".to_string(),
            address: Some(ContactAddress {
                street: "12 St James's Square".to_string(),
                city: "London".to_string(),
                ..ContactAddress::default()
            }),
            custom_fields: BTreeMap::from([("tier".to_string(), json!("gold"))]),
            sync_status: SyncStatus::Synced,
            last_synced_at: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).single(),
        }
    }

    #[test]
    fn merge_keeps_existing_values_for_empty_incoming_fields() {
        let mut current = synced_record();
        let incoming = ContactRecord {
            id: "1001".to_string(),
            phone: "555-0199".to_string(),
            sync_status: SyncStatus::PendingSync,
            ..ContactRecord::default()
        };

        current.merge_from(&incoming);

        assert_eq!(current.display_name, "Ada Lovelace");
        assert_eq!(current.email, "ada@example.com");
        assert_eq!(current.phone, "555-0199");
        assert_eq!(current.sync_status, SyncStatus::PendingSync);
        assert_eq!(current.last_synced_at, None);
        assert!(current.address.is_some());
    }

    #[test]
    fn merge_replaces_address_as_a_unit() {
        let mut current = synced_record();
        let incoming = ContactRecord {
            id: "1001".to_string(),
            address: Some(ContactAddress {
                city: "Paris".to_string(),
                country: "FR".to_string(),
                ..ContactAddress::default()
            }),
            ..synced_record()
        };

        current.merge_from(&incoming);

        let address = current.address.expect("address kept");
        assert_eq!(address.city, "Paris");
        assert_eq!(address.country, "FR");
        assert_eq!(address.street, "");
    }

    #[test]
    fn merge_is_idempotent() {
        let incoming = synced_record();
        let mut once = ContactRecord::new("1001");
        once.merge_from(&incoming);
        let mut twice = once.clone();
        twice.merge_from(&incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn temporary_ids_are_recognized() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("valid time");
        let id = new_temporary_id(now);
        assert!(id.starts_with("TEMP_20260304_050607_"));
        assert_eq!(id.len(), "TEMP_20260304_050607_".len() + 8);
        assert!(is_temporary_id(&id));
        assert!(!is_temporary_id("1001"));
    }

    #[test]
    fn sync_status_round_trips_wire_strings() {
        for status in [SyncStatus::PendingSync, SyncStatus::Synced, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("unknown"), None);
    }
}
