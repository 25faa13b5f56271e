//! Message shapes flowing through the pipeline and their parsing rules.
//!
//! Upload notifications arrive as S3-style event documents, optionally
//! wrapped once in a pub/sub envelope (`{"Message": "<json>"}`). Metadata
//! events and status updates are plain JSON bodies; the metadata type of a
//! metadata event travels as a message attribute, not in the body.

use crate::error::{PipelineError, Result};
use crate::model::{attr, Attributes, PhotoRecord, ReviewStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Extensions accepted by the ingest validator, lower-case with leading dot
pub const ALLOWED_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

/// One object reference extracted from an upload notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadNotification {
    /// Decoded storage key (also the record id)
    pub object_key: String,
}

impl UploadNotification {
    /// Lower-cased extension of the key, empty when it has none
    pub fn extension(&self) -> String {
        file_extension(&self.object_key)
    }

    pub fn has_allowed_extension(&self) -> bool {
        is_allowed_extension(&self.object_key)
    }

    /// Render as a single-reference S3-style notification body
    pub fn to_body(&self) -> String {
        serde_json::json!({
            "Records": [{
                "s3": { "object": { "key": encode_object_key(&self.object_key) } }
            }]
        })
        .to_string()
    }
}

/// Extract every object reference from a notification body.
///
/// Exactly one envelope level is unwrapped: a body with `Records` is used as
/// is, otherwise the JSON string under `Message` is parsed and its `Records`
/// used. A body with neither yields no references. Records lacking a key are
/// skipped with a warning.
pub fn parse_upload_notifications(body: &str) -> Result<Vec<UploadNotification>> {
    let outer: Value = serde_json::from_str(body)
        .map_err(|e| PipelineError::MalformedMessage(format!("upload body is not JSON: {e}")))?;

    let event = if outer.get("Records").is_some() {
        outer
    } else {
        match outer.get("Message") {
            Some(Value::String(inner)) => serde_json::from_str(inner).map_err(|e| {
                PipelineError::MalformedMessage(format!("envelope message is not JSON: {e}"))
            })?,
            _ => Value::Null,
        }
    };

    let records: &[Value] = match event.get("Records") {
        Some(Value::Array(records)) => records,
        _ => &[],
    };

    let mut notifications = Vec::with_capacity(records.len());
    for record in records {
        match raw_object_key(record) {
            Some(raw) => notifications.push(UploadNotification {
                object_key: decode_object_key(raw),
            }),
            None => warn!(record = %record, "Skipping upload record without an object key"),
        }
    }

    Ok(notifications)
}

/// Accepts both the S3 event shape and the flat `{ objectKey }` shape
fn raw_object_key(record: &Value) -> Option<&str> {
    record
        .pointer("/s3/object/key")
        .or_else(|| record.get("objectKey"))
        .and_then(Value::as_str)
}

/// Decode a form-encoded storage key: `+` becomes a space, then
/// percent-escapes are resolved. Keys that do not decode to UTF-8 are kept
/// with only the `+` substitution applied.
pub fn decode_object_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// Inverse of [`decode_object_key`], matching how S3 encodes keys in events
pub fn encode_object_key(key: &str) -> String {
    urlencoding::encode(key).replace("%20", "+")
}

/// Extension of the key from its last dot to the end, lower-cased.
///
/// `"a/b.JPG"` gives `".jpg"`, `"photo."` and `"photo"` give `""`.
pub fn file_extension(key: &str) -> String {
    match key.rfind('.') {
        Some(idx) if idx + 1 < key.len() => key[idx..].to_lowercase(),
        _ => String::new(),
    }
}

pub fn is_allowed_extension(key: &str) -> bool {
    let ext = file_extension(key);
    ALLOWED_EXTENSIONS.contains(&ext.as_str())
}

/// Metadata update for a single record attribute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataEvent {
    #[serde(default)]
    pub id: Option<String>,
    /// String or number; JSON null counts as absent
    #[serde(default)]
    pub value: Option<Value>,
    /// Routing attribute, carried out-of-band
    #[serde(skip)]
    pub metadata_type: Option<String>,
}

/// A metadata event that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataUpdate {
    pub id: String,
    pub metadata_type: String,
    pub value: String,
}

impl MetadataEvent {
    /// Build from a message body and its `metadataType` attribute
    pub fn from_message(body: &str, metadata_type: Option<&str>) -> Result<Self> {
        let mut event: MetadataEvent = serde_json::from_str(body).map_err(|e| {
            PipelineError::MalformedMessage(format!("metadata body is invalid: {e}"))
        })?;
        event.metadata_type = metadata_type.map(str::to_string);
        Ok(event)
    }

    pub fn validate(&self) -> Result<MetadataUpdate> {
        let id = non_empty(self.id.as_deref())
            .ok_or_else(|| PipelineError::MalformedMessage("metadata event has no id".into()))?;
        let value = self
            .value
            .as_ref()
            .and_then(coerce_to_string)
            .ok_or_else(|| PipelineError::MalformedMessage("metadata event has no value".into()))?;
        let metadata_type = non_empty(self.metadata_type.as_deref()).ok_or_else(|| {
            PipelineError::MalformedMessage("metadata event has no metadataType".into())
        })?;

        Ok(MetadataUpdate {
            id: id.to_string(),
            metadata_type: metadata_type.to_string(),
            value,
        })
    }
}

/// String conversion of a JSON value: strings verbatim, other scalars in
/// their canonical text form, containers as compact JSON, null as absent.
pub fn coerce_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Review decision published by reviewers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub update: Option<StatusChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// A status update that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedStatus {
    pub id: String,
    pub status: ReviewStatus,
    pub reason: String,
    /// Empty when the update carried no date
    pub updated_at: String,
}

impl ValidatedStatus {
    /// The three attributes written atomically
    pub fn attributes(&self) -> Attributes {
        Attributes::from([
            (attr::STATUS.to_string(), self.status.as_str().to_string()),
            (attr::REASON.to_string(), self.reason.clone()),
            (attr::STATUS_UPDATED_AT.to_string(), self.updated_at.clone()),
        ])
    }
}

impl StatusUpdate {
    pub fn from_body(body: &str) -> Result<Self> {
        serde_json::from_str(body)
            .map_err(|e| PipelineError::MalformedMessage(format!("status body is invalid: {e}")))
    }

    pub fn validate(&self) -> Result<ValidatedStatus> {
        let id = non_empty(self.id.as_deref())
            .ok_or_else(|| PipelineError::MalformedMessage("status update has no id".into()))?;
        let change = self
            .update
            .as_ref()
            .ok_or_else(|| PipelineError::MalformedMessage("status update has no update".into()))?;
        let status = non_empty(change.status.as_deref()).ok_or_else(|| {
            PipelineError::MalformedMessage("status update has no status".into())
        })?;
        let reason = non_empty(change.reason.as_deref()).ok_or_else(|| {
            PipelineError::MalformedMessage("status update has no reason".into())
        })?;

        Ok(ValidatedStatus {
            id: id.to_string(),
            status: status.parse()?,
            reason: reason.to_string(),
            updated_at: self.date.clone().unwrap_or_default(),
        })
    }
}

/// Kind of mutation reported by the change feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Modify => "MODIFY",
            ChangeKind::Remove => "REMOVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(ChangeKind::Insert),
            "MODIFY" => Some(ChangeKind::Modify),
            "REMOVE" => Some(ChangeKind::Remove),
            _ => None,
        }
    }
}

/// Before/after snapshot of one record mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub kind: ChangeKind,
    pub key: String,
    #[serde(default)]
    pub old_image: Option<PhotoRecord>,
    #[serde(default)]
    pub new_image: Option<PhotoRecord>,
}

/// Position in a record store's change feed
pub type ChangeSequence = i64;

/// A change record together with its feed position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedChange {
    pub sequence: ChangeSequence,
    pub change: ChangeRecord,
}
