//! Maps loosely-typed remote contact payloads into [`ContactRecord`].
//!
//! This is the only place that inspects raw remote shapes. Everything
//! downstream works with the canonical record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{ContactAddress, ContactRecord, SyncStatus};

const NAME_PLACEHOLDER: &str = "N/A";
const ANNOTATION_SEPARATOR: &str = " (";

/// Keys consumed by the fixed schema. Anything else lands in `custom_fields`.
const MAPPED_KEYS: &[&str] = &[
    "ContactId",
    "Name",
    "FirstName",
    "LastName",
    "CompanyName",
    "Company Name",
    "CompanyMetaData",
    "Email",
    "Phone",
    "Address",
    "City",
    "State",
    "Zip",
    "PostalCode",
    "Country",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("remote contact is not a JSON object")]
    NotAnObject,
    #[error("remote contact has no ContactId")]
    MissingId,
    #[error("unexpected shape for field {field}")]
    UnexpectedShape { field: String },
}

/// Extracts the remote identifier without normalizing the rest of the record.
pub fn raw_contact_id(raw: &Value) -> Option<String> {
    let id = match raw.get("ContactId")? {
        Value::String(value) => value.trim().to_string(),
        Value::Number(value) => value.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

/// Converts one raw remote record into a canonical, synced [`ContactRecord`].
pub fn normalize_contact(
    raw: &Value,
    synced_at: DateTime<Utc>,
) -> Result<ContactRecord, NormalizeError> {
    let object = raw.as_object().ok_or(NormalizeError::NotAnObject)?;
    let id = raw_contact_id(raw).ok_or(NormalizeError::MissingId)?;

    let company_name = company_name(object);
    let (first_name, last_name, display_name) = names(object)?;
    let display_name = if !display_name.is_empty() {
        display_name
    } else if !company_name.is_empty() {
        company_name.clone()
    } else {
        NAME_PLACEHOLDER.to_string()
    };

    Ok(ContactRecord {
        id,
        display_name,
        first_name,
        last_name,
        company_name,
        email: first_text(object.get("Email"), "Email")?,
        phone: first_text(object.get("Phone"), "Phone")?,
        address: address(object)?,
        custom_fields: unmapped_fields(object),
        sync_status: SyncStatus::Synced,
        last_synced_at: Some(synced_at),
    })
}

fn company_name(object: &Map<String, Value>) -> String {
    ["CompanyName", "Company Name"]
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
        .or_else(|| {
            object
                .get("CompanyMetaData")
                .and_then(|meta| meta.get("CompanyName"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_default()
        .to_string()
}

/// Returns `(first, last, display)`; display is empty when no name is present.
fn names(object: &Map<String, Value>) -> Result<(String, String, String), NormalizeError> {
    match object.get("Name") {
        Some(Value::Object(name)) => Ok(structured_name(
            name.get("FirstName"),
            name.get("LastName"),
        )),
        Some(Value::String(name)) => {
            let name = name.trim();
            let (first, last) = match name.split_once(' ') {
                Some((first, last)) => (first.to_string(), last.trim().to_string()),
                None => (name.to_string(), String::new()),
            };
            Ok((first, last, name.to_string()))
        }
        Some(Value::Null) | None => Ok(structured_name(
            object.get("FirstName"),
            object.get("LastName"),
        )),
        Some(_) => Err(NormalizeError::UnexpectedShape {
            field: "Name".to_string(),
        }),
    }
}

fn structured_name(first: Option<&Value>, last: Option<&Value>) -> (String, String, String) {
    let first = first.and_then(Value::as_str).unwrap_or_default().trim();
    let last = last.and_then(Value::as_str).unwrap_or_default().trim();
    let display = format!("{first} {last}").trim().to_string();
    (first.to_string(), last.to_string(), display)
}

/// Reduces a multi-valued email/phone field to its first entry without annotation.
fn first_text(value: Option<&Value>, field: &str) -> Result<String, NormalizeError> {
    let text = match value {
        None | Some(Value::Null) => return Ok(String::new()),
        Some(Value::Array(entries)) => match entries.first() {
            None => return Ok(String::new()),
            Some(entry) => entry_text(entry, field)?,
        },
        Some(entry) => entry_text(entry, field)?,
    };
    Ok(strip_annotation(&text))
}

fn entry_text(entry: &Value, field: &str) -> Result<String, NormalizeError> {
    match entry {
        Value::String(text) => Ok(text.clone()),
        Value::Number(number) => Ok(number.to_string()),
        Value::Object(object) => Ok(object
            .get("Text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()),
        Value::Null => Ok(String::new()),
        _ => Err(NormalizeError::UnexpectedShape {
            field: field.to_string(),
        }),
    }
}

fn strip_annotation(text: &str) -> String {
    text.split_once(ANNOTATION_SEPARATOR)
        .map_or(text, |(head, _)| head)
        .trim()
        .to_string()
}

fn address(object: &Map<String, Value>) -> Result<Option<ContactAddress>, NormalizeError> {
    let address = match object.get("Address") {
        None | Some(Value::Null) => None,
        Some(Value::Array(entries)) => match entries.first() {
            None | Some(Value::Null) => None,
            Some(Value::Object(entry)) => Some(structured_address(entry)),
            Some(_) => {
                return Err(NormalizeError::UnexpectedShape {
                    field: "Address".to_string(),
                });
            }
        },
        Some(Value::Object(entry)) => Some(structured_address(entry)),
        Some(Value::String(street)) => Some(ContactAddress {
            street: street.trim().to_string(),
            ..flat_address(object)
        }),
        Some(_) => {
            return Err(NormalizeError::UnexpectedShape {
                field: "Address".to_string(),
            });
        }
    };
    Ok(address.filter(|address| !address.is_empty()))
}

fn structured_address(entry: &Map<String, Value>) -> ContactAddress {
    ContactAddress {
        street: text_of(entry, &["Street", "Address"]),
        city: text_of(entry, &["City"]),
        state: text_of(entry, &["State"]),
        postal_code: text_of(entry, &["Zip", "PostalCode"]),
        country: text_of(entry, &["Country"]),
    }
}

fn flat_address(object: &Map<String, Value>) -> ContactAddress {
    ContactAddress {
        street: String::new(),
        ..structured_address(object)
    }
}

fn text_of(object: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| match object.get(*key) {
            Some(Value::String(value)) => Some(value.trim().to_string()),
            Some(Value::Number(value)) => Some(value.to_string()),
            _ => None,
        })
        .find(|value| !value.is_empty())
        .unwrap_or_default()
}

fn unmapped_fields(object: &Map<String, Value>) -> BTreeMap<String, Value> {
    object
        .iter()
        .filter(|(key, _)| !MAPPED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn synced_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0)
            .single()
            .expect("valid time")
    }

    #[test]
    fn structured_name_is_concatenated_and_trimmed() {
        let raw = json!({
            "ContactId": "3001",
            "Name": {"FirstName": " Grace ", "LastName": "Hopper"},
        });
        let record = normalize_contact(&raw, synced_at()).expect("normalizes");
        assert_eq!(record.display_name, "Grace Hopper");
        assert_eq!(record.first_name, "Grace");
        assert_eq!(record.last_name, "Hopper");
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(record.last_synced_at, Some(synced_at()));
    }

    #[test]
    fn bare_string_name_is_used_as_is() {
        let raw = json!({"ContactId": 42, "Name": "Grace Brewster Hopper"});
        let record = normalize_contact(&raw, synced_at()).expect("normalizes");
        assert_eq!(record.id, "42");
        assert_eq!(record.display_name, "Grace Brewster Hopper");
        assert_eq!(record.first_name, "Grace");
        assert_eq!(record.last_name, "Brewster Hopper");
    }

    #[test]
    fn missing_name_falls_back_to_company_then_placeholder() {
        let with_company = json!({
            "ContactId": "1",
            "CompanyMetaData": {"CompanyName": "Fuel Depot LLC"},
        });
        let record = normalize_contact(&with_company, synced_at()).expect("normalizes");
        assert_eq!(record.display_name, "Fuel Depot LLC");
        assert_eq!(record.company_name, "Fuel Depot LLC");

        let bare = json!({"ContactId": "2"});
        let record = normalize_contact(&bare, synced_at()).expect("normalizes");
        assert_eq!(record.display_name, "N/A");
        assert_eq!(record.company_name, "");
    }

    #[test]
    fn blank_string_name_falls_back_like_a_missing_one() {
        let with_company = json!({
            "ContactId": "3",
            "Name": "   ",
            "CompanyName": "Fuel Depot LLC",
        });
        let record = normalize_contact(&with_company, synced_at()).expect("normalizes");
        assert_eq!(record.display_name, "Fuel Depot LLC");
        assert_eq!(record.first_name, "");

        let blank = json!({"ContactId": "4", "Name": "  "});
        let record = normalize_contact(&blank, synced_at()).expect("normalizes");
        assert_eq!(record.display_name, "N/A");

        let padded = json!({"ContactId": "5", "Name": "  Ada Lovelace "});
        let record = normalize_contact(&padded, synced_at()).expect("normalizes");
        assert_eq!(record.display_name, "Ada Lovelace");
        assert_eq!(record.last_name, "Lovelace");
    }

    #[test]
    fn email_shapes_normalize_to_the_same_address() {
        let shapes = [
            json!("ops@example.com"),
            json!("ops@example.com (Work)"),
            json!([{"Text": "ops@example.com (Work)", "Type": "Work"}]),
        ];
        for shape in shapes {
            let raw = json!({"ContactId": "7", "Email": shape});
            let record = normalize_contact(&raw, synced_at()).expect("normalizes");
            assert_eq!(record.email, "ops@example.com");
        }

        for empty in [json!(""), json!([]), Value::Null] {
            let raw = json!({"ContactId": "7", "Email": empty});
            let record = normalize_contact(&raw, synced_at()).expect("normalizes");
            assert_eq!(record.email, "");
        }
    }

    #[test]
    fn phone_list_takes_first_entry() {
        let raw = json!({
            "ContactId": "8",
            "Phone": [{"Text": "555-0101 (Mobile)"}, {"Text": "555-0102 (Work)"}],
        });
        let record = normalize_contact(&raw, synced_at()).expect("normalizes");
        assert_eq!(record.phone, "555-0101");
    }

    #[test]
    fn address_list_maps_first_entry_and_absent_is_none() {
        let raw = json!({
            "ContactId": "9",
            "Address": [
                {"Street": "1 Main St", "City": "Tulsa", "State": "OK", "Zip": "74103", "Country": "US"},
                {"Street": "ignored"},
            ],
        });
        let record = normalize_contact(&raw, synced_at()).expect("normalizes");
        assert_eq!(
            record.address,
            Some(ContactAddress {
                street: "1 Main St".to_string(),
                city: "Tulsa".to_string(),
                state: "OK".to_string(),
                postal_code: "74103".to_string(),
                country: "US".to_string(),
            })
        );

        for absent in [json!({"ContactId": "10"}), json!({"ContactId": "10", "Address": []})] {
            let record = normalize_contact(&absent, synced_at()).expect("normalizes");
            assert_eq!(record.address, None);
        }
    }

    #[test]
    fn flat_address_uses_top_level_parts() {
        let raw = json!({
            "ContactId": "11",
            "Address": "500 Refinery Rd",
            "City": "Ponca City",
            "State": "OK",
        });
        let record = normalize_contact(&raw, synced_at()).expect("normalizes");
        let address = record.address.expect("address present");
        assert_eq!(address.street, "500 Refinery Rd");
        assert_eq!(address.city, "Ponca City");
        assert_eq!(address.state, "OK");
    }

    #[test]
    fn unmapped_fields_are_kept_under_their_remote_names() {
        let raw = json!({
            "ContactId": "12",
            "Name": "Site Manager",
            "Background Info": "met at expo",
            "source_form": "loi",
        });
        let record = normalize_contact(&raw, synced_at()).expect("normalizes");
        assert_eq!(
            record.custom_fields.get("Background Info"),
            Some(&json!("met at expo"))
        );
        assert_eq!(record.custom_fields.get("source_form"), Some(&json!("loi")));
        assert!(!record.custom_fields.contains_key("Name"));
        assert!(!record.custom_fields.contains_key("ContactId"));
    }

    #[test]
    fn malformed_records_are_reported() {
        assert_eq!(
            normalize_contact(&json!(["not", "an", "object"]), synced_at()),
            Err(NormalizeError::NotAnObject)
        );
        assert_eq!(
            normalize_contact(&json!({"Name": "No Id"}), synced_at()),
            Err(NormalizeError::MissingId)
        );
        assert_eq!(
            normalize_contact(&json!({"ContactId": "1", "Name": 17}), synced_at()),
            Err(NormalizeError::UnexpectedShape {
                field: "Name".to_string()
            })
        );
    }
}
