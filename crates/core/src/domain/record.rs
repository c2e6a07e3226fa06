use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of a bitable app (base).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppToken(pub String);

/// Opaque identifier of a table inside an app.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId(pub String);

/// Opaque identifier of a record inside a table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

/// Opaque channel user identifier (`open_id`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// The locator triplet required for any mutating record call.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordLocator {
    pub app_token: AppToken,
    pub table_id: TableId,
    pub record_id: RecordId,
}

impl RecordLocator {
    pub fn new(
        app_token: impl Into<String>,
        table_id: impl Into<String>,
        record_id: impl Into<String>,
    ) -> Self {
        Self {
            app_token: AppToken(app_token.into()),
            table_id: TableId(table_id.into()),
            record_id: RecordId(record_id.into()),
        }
    }

    /// Serialization key used to gate per-record processing.
    pub fn serialization_key(&self) -> String {
        format!("{}:{}:{}", self.app_token.0, self.table_id.0, self.record_id.0)
    }
}

/// A typed bitable field value. The upstream API is duck-typed; values that do
/// not fit one of the known kinds are carried verbatim as `Unknown`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    SingleSelect(String),
    MultiSelect(Vec<String>),
    /// Epoch milliseconds, UTC.
    DateMs(i64),
    /// List of opaque user ids.
    Person(Vec<UserId>),
    Phone(String),
    Location(String),
    /// Links to records in another table.
    Link(Vec<RecordId>),
    Unknown(Value),
}

impl FieldValue {
    /// Best-effort scalar rendering used by templates and card output.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) | Self::SingleSelect(text) | Self::Phone(text)
            | Self::Location(text) => text.clone(),
            Self::Number(value) => {
                if value.fract() == 0.0 && value.abs() < 9.0e15 {
                    format!("{}", *value as i64)
                } else {
                    format!("{value}")
                }
            }
            Self::MultiSelect(values) => values.join(", "),
            Self::DateMs(ms) => ms.to_string(),
            Self::Person(ids) => {
                ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", ")
            }
            Self::Link(ids) => ids.iter().map(|id| id.0.as_str()).collect::<Vec<_>>().join(", "),
            Self::Unknown(raw) => raw.to_string(),
        }
    }

    /// Parses a raw upstream JSON value into the closest known kind.
    pub fn from_raw(raw: &Value) -> Self {
        match raw {
            Value::String(text) => Self::Text(text.clone()),
            Value::Number(number) => match number.as_f64() {
                Some(value) => Self::Number(value),
                None => Self::Unknown(raw.clone()),
            },
            Value::Array(items) => {
                if items.iter().all(|item| item.is_string()) {
                    let values = items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_owned))
                        .collect();
                    return Self::MultiSelect(values);
                }
                if let Some(people) = person_list(items) {
                    return Self::Person(people);
                }
                if let Some(links) = link_list(items) {
                    return Self::Link(links);
                }
                Self::Unknown(raw.clone())
            }
            Value::Object(map) => {
                if let Some(Value::String(text)) = map.get("text") {
                    return Self::Text(text.clone());
                }
                Self::Unknown(raw.clone())
            }
            _ => Self::Unknown(raw.clone()),
        }
    }

    /// Encodes a value back into the upstream wire shape.
    pub fn to_raw(&self) -> Value {
        match self {
            Self::Text(text) | Self::SingleSelect(text) | Self::Phone(text)
            | Self::Location(text) => Value::String(text.clone()),
            Self::Number(value) => {
                if value.fract() == 0.0 && value.abs() < 9.0e15 {
                    Value::Number((*value as i64).into())
                } else {
                    serde_json::Number::from_f64(*value).map(Value::Number).unwrap_or(Value::Null)
                }
            }
            Self::MultiSelect(values) => {
                Value::Array(values.iter().cloned().map(Value::String).collect())
            }
            Self::DateMs(ms) => Value::Number((*ms).into()),
            Self::Person(ids) => Value::Array(
                ids.iter().map(|id| serde_json::json!({"id": id.0})).collect(),
            ),
            Self::Link(ids) => Value::Array(
                ids.iter().map(|id| serde_json::json!({"record_ids": [id.0]})).collect(),
            ),
            Self::Unknown(raw) => raw.clone(),
        }
    }

    /// Equality used by change detection. `Unknown` values compare by their
    /// serialized bytes so drift in shapes we do not model is still observed.
    pub fn semantically_equals(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (Self::Unknown(a), Self::Unknown(b)) => {
                serde_json::to_vec(a).ok() == serde_json::to_vec(b).ok()
            }
            (a, b) => a == b,
        }
    }
}

fn person_list(items: &[Value]) -> Option<Vec<UserId>> {
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let object = item.as_object()?;
        let id = object.get("id").and_then(Value::as_str)?;
        if !id.starts_with("ou_") {
            return None;
        }
        ids.push(UserId(id.to_owned()));
    }
    Some(ids)
}

fn link_list(items: &[Value]) -> Option<Vec<RecordId>> {
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        let object = item.as_object()?;
        let id = object.get("record_ids").and_then(Value::as_array).and_then(|list| {
            list.first().and_then(Value::as_str)
        });
        match id {
            Some(id) => ids.push(RecordId(id.to_owned())),
            None => return None,
        }
    }
    Some(ids)
}

/// A record's field map, keyed by field name. `BTreeMap` keeps diffing and
/// business-key hashing deterministic.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// One observed change to a single field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<FieldValue>,
    pub new: Option<FieldValue>,
}

/// The diff between a snapshot and the currently fetched fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChangeSet {
    pub changes: Vec<FieldChange>,
}

impl ChangeSet {
    /// Diffs `old` against `new`, reporting added, removed, and modified
    /// fields in field-name order.
    pub fn diff(old: &FieldMap, new: &FieldMap) -> Self {
        let mut changes = Vec::new();

        for (field, new_value) in new {
            match old.get(field) {
                Some(old_value) if old_value.semantically_equals(new_value) => {}
                Some(old_value) => changes.push(FieldChange {
                    field: field.clone(),
                    old: Some(old_value.clone()),
                    new: Some(new_value.clone()),
                }),
                None => changes.push(FieldChange {
                    field: field.clone(),
                    old: None,
                    new: Some(new_value.clone()),
                }),
            }
        }

        for (field, old_value) in old {
            if !new.contains_key(field) {
                changes.push(FieldChange {
                    field: field.clone(),
                    old: Some(old_value.clone()),
                    new: None,
                });
            }
        }

        changes.sort_by(|a, b| a.field.cmp(&b.field));
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changed_fields(&self) -> Vec<&str> {
        self.changes.iter().map(|change| change.field.as_str()).collect()
    }

    pub fn get(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|change| change.field == field)
    }
}

/// The normalized event kinds the automation engine reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    FieldChanged,
    SchemaChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::FieldChanged => "field_changed",
            Self::SchemaChanged => "schema_changed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "field_changed" => Some(Self::FieldChanged),
            "schema_changed" => Some(Self::SchemaChanged),
            _ => None,
        }
    }
}

/// A normalized inbound change event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_kind: EventKind,
    pub locator: RecordLocator,
    pub payload: Value,
    pub received_at_ms: i64,
}
