//! Function-style RPC client for the remote CRM directory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{Map, Value, json};

use crate::types::ContactRecord;

pub const DEFAULT_BASE_URL: &str = "https://api.lessannoyingcrm.com";
pub const DEFAULT_PAGE_SIZE: u32 = 500;

const FUNCTION_LIST_CONTACTS: &str = "GetContacts";
const FUNCTION_GET_CONTACT: &str = "GetContact";
const FUNCTION_CREATE_CONTACT: &str = "CreateContact";
const FUNCTION_EDIT_CONTACT: &str = "EditContact";

const PERMANENT_ENVELOPE_MARKERS: &[&str] = &[
    "invalid",
    "missing",
    "required",
    "malformed",
    "not found",
    "notfound",
    "does not exist",
];
const AUTH_ENVELOPE_MARKERS: &[&str] = &["token", "auth", "permission", "usercode"];
const RATE_LIMIT_ENVELOPE_MARKERS: &[&str] = &["rate", "too many", "throttl"];

/// Failure classes used by the sync engine for retry and backoff decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryErrorClass {
    Auth,
    RateLimited,
    Network,
    /// Request rejected as malformed input. Never retried.
    Validation,
    /// Application-level error reported inside an otherwise successful response.
    Envelope,
    /// Response body could not be interpreted.
    Malformed,
    Unknown,
}

impl DirectoryErrorClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Envelope => "envelope",
            Self::Malformed => "malformed",
            Self::Unknown => "unknown",
        }
    }
}

/// Structured directory call failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("directory {} error: {message}", .class.as_str())]
pub struct DirectoryError {
    pub class: DirectoryErrorClass,
    pub message: String,
}

impl DirectoryError {
    pub fn new(class: DirectoryErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Retrying cannot succeed; the operation should be failed immediately.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.class == DirectoryErrorClass::Validation
    }

    /// The endpoint as a whole is unusable right now, not just this record.
    #[must_use]
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self.class,
            DirectoryErrorClass::Network
                | DirectoryErrorClass::Auth
                | DirectoryErrorClass::RateLimited
        )
    }
}

/// One page of raw remote contacts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirectoryPage {
    pub records: Vec<Value>,
    pub next_page: Option<u32>,
}

/// Remote system of record for contacts.
#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    /// Lists one page of contacts. Pages are numbered from 1.
    async fn list_all(&self, page: u32) -> Result<DirectoryPage, DirectoryError>;

    async fn list_one(&self, contact_id: &str) -> Result<Value, DirectoryError>;

    /// Creates the contact remotely and returns the remote-issued identifier.
    async fn create(&self, record: &ContactRecord) -> Result<String, DirectoryError>;

    async fn update(&self, record: &ContactRecord) -> Result<(), DirectoryError>;
}

#[derive(Debug, Clone)]
pub struct HttpDirectoryClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub timeout: Duration,
    pub page_size: u32,
}

impl Default for HttpDirectoryClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_token: String::new(),
            timeout: Duration::from_secs(30),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// HTTP implementation of [`RemoteDirectory`].
#[derive(Clone)]
pub struct HttpDirectoryClient {
    client: HttpClient,
    base_url: String,
    api_token: String,
    user_code: String,
    page_size: u32,
}

impl HttpDirectoryClient {
    pub fn new(config: HttpDirectoryClientConfig) -> Result<Self, String> {
        let base_url = normalize_http_base_url(&config.base_url)?;
        let api_token = config.api_token.trim().to_string();
        if api_token.is_empty() {
            return Err("api token must not be empty".to_string());
        }
        let user_code = api_token
            .split_once('-')
            .map_or(api_token.as_str(), |(code, _)| code)
            .to_string();

        Ok(Self {
            client: HttpClient::builder()
                .timeout(config.timeout)
                .build()
                .map_err(|error| format!("directory http client init failed: {error}"))?,
            base_url,
            api_token,
            user_code,
            page_size: config.page_size.max(1),
        })
    }

    async fn call(&self, function: &str, parameters: Value) -> Result<Value, DirectoryError> {
        let body = json!({
            "APIToken": self.api_token,
            "UserCode": self.user_code,
            "Function": function,
            "Parameters": parameters,
        });

        let response = self
            .client
            .post(self.base_url.as_str())
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|error| {
                DirectoryError::new(
                    DirectoryErrorClass::Network,
                    format!("{function} request failed: {error}"),
                )
            })?;
        let status = response.status();
        let payload = response.text().await.map_err(|error| {
            DirectoryError::new(
                DirectoryErrorClass::Network,
                format!("{function} response read failed: {error}"),
            )
        })?;
        if !status.is_success() {
            return Err(DirectoryError::new(
                classify_status(status),
                format!(
                    "{function} failed status={} body={}",
                    status.as_u16(),
                    truncate(&payload)
                ),
            ));
        }

        parse_envelope(&payload).inspect_err(|error| {
            tracing::warn!(
                function,
                class = error.class.as_str(),
                reason = %error.message,
                "directory call returned an error envelope"
            );
        })
    }
}

#[async_trait]
impl RemoteDirectory for HttpDirectoryClient {
    async fn list_all(&self, page: u32) -> Result<DirectoryPage, DirectoryError> {
        let envelope = self
            .call(
                FUNCTION_LIST_CONTACTS,
                json!({ "Page": page, "MaxNumberOfResults": self.page_size }),
            )
            .await?;
        let records = extract_results(&envelope);
        let has_more = envelope
            .get("HasMoreResults")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let next_page = (has_more && !records.is_empty()).then(|| page.saturating_add(1));
        Ok(DirectoryPage { records, next_page })
    }

    async fn list_one(&self, contact_id: &str) -> Result<Value, DirectoryError> {
        let envelope = self
            .call(FUNCTION_GET_CONTACT, json!({ "ContactId": contact_id }))
            .await?;
        extract_results(&envelope).into_iter().next().ok_or_else(|| {
            DirectoryError::new(
                DirectoryErrorClass::Validation,
                format!("contact {contact_id} not found"),
            )
        })
    }

    async fn create(&self, record: &ContactRecord) -> Result<String, DirectoryError> {
        let envelope = self
            .call(FUNCTION_CREATE_CONTACT, contact_parameters(record))
            .await?;
        parse_contact_id(&envelope).ok_or_else(|| {
            DirectoryError::new(
                DirectoryErrorClass::Malformed,
                format!("{FUNCTION_CREATE_CONTACT} response missing ContactId"),
            )
        })
    }

    async fn update(&self, record: &ContactRecord) -> Result<(), DirectoryError> {
        let mut parameters = contact_parameters(record);
        if let Value::Object(object) = &mut parameters {
            object.insert("ContactId".to_string(), Value::String(record.id.clone()));
        }
        self.call(FUNCTION_EDIT_CONTACT, parameters).await?;
        Ok(())
    }
}

/// Parses a response body by content, regardless of the declared content type,
/// and surfaces embedded application errors.
pub fn parse_envelope(body: &str) -> Result<Value, DirectoryError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(DirectoryError::new(
            DirectoryErrorClass::Malformed,
            "empty response body",
        ));
    }
    let value = serde_json::from_str::<Value>(body).map_err(|error| {
        DirectoryError::new(
            DirectoryErrorClass::Malformed,
            format!("response is not json: {error} body={}", truncate(body)),
        )
    })?;

    if let Some(code) = value.get("ErrorCode").filter(|code| !code.is_null()) {
        let code = match code {
            Value::String(code) => code.clone(),
            other => other.to_string(),
        };
        let description = value
            .get("ErrorDescription")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(DirectoryError::new(
            classify_envelope(&code, description),
            format!("ErrorCode={code} ErrorDescription={description}"),
        ));
    }
    if value.get("Success").and_then(Value::as_bool) == Some(false) {
        let description = value
            .get("Error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(DirectoryError::new(
            classify_envelope("", description),
            format!("Success=false Error={description}"),
        ));
    }

    Ok(value)
}

/// Pulls the record list out of the `Result`/`Results` wrapper, or the body itself.
pub fn extract_results(envelope: &Value) -> Vec<Value> {
    let payload = envelope
        .get("Results")
        .or_else(|| envelope.get("Result"))
        .unwrap_or(envelope);
    match payload {
        Value::Array(items) => items.clone(),
        Value::Object(object) if object.contains_key("ContactId") => vec![payload.clone()],
        _ => Vec::new(),
    }
}

fn parse_contact_id(envelope: &Value) -> Option<String> {
    let id = envelope
        .get("ContactId")
        .or_else(|| envelope.pointer("/Result/ContactId"))?;
    let id = match id {
        Value::String(value) => value.trim().to_string(),
        Value::Number(value) => value.to_string(),
        _ => return None,
    };
    (!id.is_empty()).then_some(id)
}

/// Remote parameter shape for create/edit calls.
pub fn contact_parameters(record: &ContactRecord) -> Value {
    let mut object = Map::new();
    for (key, value) in &record.custom_fields {
        object.insert(key.clone(), value.clone());
    }
    let name = if record.first_name.is_empty() && record.last_name.is_empty() {
        json!(record.display_name)
    } else {
        json!({ "FirstName": record.first_name, "LastName": record.last_name })
    };
    object.insert("Name".to_string(), name);
    object.insert("CompanyName".to_string(), json!(record.company_name));
    object.insert("Email".to_string(), json!(record.email));
    object.insert("Phone".to_string(), json!(record.phone));
    if let Some(address) = record.address.as_ref() {
        object.insert(
            "Address".to_string(),
            json!([{
                "Street": address.street,
                "City": address.city,
                "State": address.state,
                "Zip": address.postal_code,
                "Country": address.country,
            }]),
        );
    }
    Value::Object(object)
}

fn classify_envelope(code: &str, description: &str) -> DirectoryErrorClass {
    let haystack = format!("{code} {description}").to_ascii_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|marker| haystack.contains(marker));
    if contains_any(AUTH_ENVELOPE_MARKERS) {
        DirectoryErrorClass::Auth
    } else if contains_any(RATE_LIMIT_ENVELOPE_MARKERS) {
        DirectoryErrorClass::RateLimited
    } else if contains_any(PERMANENT_ENVELOPE_MARKERS) {
        DirectoryErrorClass::Validation
    } else {
        DirectoryErrorClass::Envelope
    }
}

fn classify_status(status: StatusCode) -> DirectoryErrorClass {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DirectoryErrorClass::Auth,
        StatusCode::TOO_MANY_REQUESTS => DirectoryErrorClass::RateLimited,
        StatusCode::BAD_REQUEST
        | StatusCode::UNPROCESSABLE_ENTITY
        | StatusCode::CONFLICT
        | StatusCode::NOT_FOUND => DirectoryErrorClass::Validation,
        s if s.is_server_error() => DirectoryErrorClass::Network,
        _ => DirectoryErrorClass::Unknown,
    }
}

fn normalize_http_base_url(value: &str) -> Result<String, String> {
    let normalized = value.trim();
    if normalized.is_empty() {
        return Err("base_url must not be empty".to_string());
    }
    let parsed =
        reqwest::Url::parse(normalized).map_err(|error| format!("invalid base_url: {error}"))?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(format!("unsupported base_url scheme: {scheme}"));
    }
    Ok(normalized.trim_end_matches('/').to_string())
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}
