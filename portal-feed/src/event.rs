use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A raw notification as pushed by the event stream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    #[serde(default, deserialize_with = "u64_from_number_or_string")]
    pub timestamp_ms: u64,
    #[serde(default, deserialize_with = "optional_u64_from_number_or_string")]
    pub checkpoint_id: Option<u64>,
    pub transaction_hash: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventKind {
    PackageEvent,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Fully qualified type, e.g. `0x2a::document_system::DocumentUploaded`.
    pub event_type: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl EventPayload {
    /// Read a field as text. Numbers are rendered in decimal.
    pub fn text(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            Value::String(value) => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }

    /// Read a field as an unsigned integer. Move serializes `u64` as a
    /// decimal string, so both representations are accepted.
    pub fn unsigned(&self, name: &str) -> Option<u64> {
        match self.fields.get(name)? {
            Value::Number(value) => value.as_u64(),
            Value::String(value) => value.parse().ok(),
            _ => None,
        }
    }
}

/// A classified portal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    DocumentUploaded(DocumentUploaded),
    DocumentVoted(DocumentVoted),
}

impl DomainEvent {
    pub fn transaction_hash(&self) -> &str {
        match self {
            DomainEvent::DocumentUploaded(event) => &event.transaction_hash,
            DomainEvent::DocumentVoted(event) => &event.transaction_hash,
        }
    }

    pub fn document_id(&self) -> &str {
        match self {
            DomainEvent::DocumentUploaded(event) => &event.document_id,
            DomainEvent::DocumentVoted(event) => &event.document_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUploaded {
    pub transaction_hash: String,
    pub document_id: String,
    pub uploader: String,
    pub title: String,
    pub blob_id: String,
    pub category: String,
    /// Milliseconds since the unix epoch.
    pub timestamp: u64,
}

impl DocumentUploaded {
    pub(crate) fn from_stream(event: &StreamEvent) -> Self {
        let payload = &event.payload;

        Self {
            transaction_hash: event.transaction_hash.clone(),
            document_id: payload.text("document_id").unwrap_or_default(),
            uploader: payload.text("uploader").unwrap_or_default(),
            title: payload.text("title").unwrap_or_default(),
            blob_id: payload.text("walrus_blob_id").unwrap_or_default(),
            category: payload.text("category").unwrap_or_default(),
            timestamp: payload.unsigned("timestamp").unwrap_or(event.timestamp_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentVoted {
    pub transaction_hash: String,
    pub document_id: String,
    pub voter: String,
    pub new_vote_count: u64,
}

impl DocumentVoted {
    pub(crate) fn from_stream(event: &StreamEvent) -> Self {
        let payload = &event.payload;

        Self {
            transaction_hash: event.transaction_hash.clone(),
            document_id: payload.text("document_id").unwrap_or_default(),
            voter: payload.text("voter").unwrap_or_default(),
            new_vote_count: payload.unsigned("new_vote_count").unwrap_or(0),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

impl NumberOrString {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            NumberOrString::Number(value) => Ok(value),
            NumberOrString::String(value) => value.parse().map_err(E::custom),
        }
    }
}

fn u64_from_number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    NumberOrString::deserialize(deserializer)?.into_u64()
}

fn optional_u64_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<NumberOrString>::deserialize(deserializer)?
        .map(NumberOrString::into_u64)
        .transpose()
}
