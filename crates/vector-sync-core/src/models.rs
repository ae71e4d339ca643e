//! Core data models used throughout Vector Sync.
//!
//! These types represent the local records, the remote index items, and the
//! change entries that flow from detection to application.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::IntegrityError;

/// Metadata key holding the canonical text on the remote side.
pub const RAW_STRING_KEY: &str = "raw_string";

/// Names of the designated fields in a dataset record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    pub id_field: String,
    pub path_field: String,
    pub description_field: String,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            id_field: "id".to_string(),
            path_field: "path".to_string(),
            description_field: "description".to_string(),
        }
    }
}

/// One local record, with every non-id field already stringified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    path: String,
    description: String,
    fields: BTreeMap<String, String>,
}

impl Record {
    /// Build a record from one parsed dataset line.
    ///
    /// The id field must be a non-empty string. Every other field must be a
    /// scalar; the path and description fields must be present.
    pub fn from_value(value: &Value, schema: &RecordSchema) -> Result<Self, IntegrityError> {
        let obj = value.as_object().ok_or(IntegrityError::NotAnObject)?;

        let id = match obj.get(&schema.id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => {
                return Err(IntegrityError::MissingId {
                    field: schema.id_field.clone(),
                })
            }
        };

        let mut fields = BTreeMap::new();
        for (key, raw) in obj {
            if key == &schema.id_field {
                continue;
            }
            if key == RAW_STRING_KEY {
                return Err(IntegrityError::ReservedField {
                    id,
                    field: key.clone(),
                });
            }
            let text = stringify(raw).ok_or_else(|| IntegrityError::NonScalarField {
                id: id.clone(),
                field: key.clone(),
            })?;
            fields.insert(key.clone(), text);
        }

        let required = |field: &str| {
            fields
                .get(field)
                .cloned()
                .ok_or_else(|| IntegrityError::MissingField {
                    id: id.clone(),
                    field: field.to_string(),
                })
        };
        let path = required(&schema.path_field)?;
        let description = required(&schema.description_field)?;

        Ok(Self {
            id,
            path,
            description,
            fields,
        })
    }

    /// `"Full Path: {path}, Description: {description}"`.
    pub fn canonical_text(&self) -> String {
        canonical_text(&self.path, &self.description)
    }

    /// Stringified fields, excluding the identifier.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Metadata stored alongside the vector: the fields plus `raw_string`.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        let mut metadata = self.fields.clone();
        metadata.insert(RAW_STRING_KEY.to_string(), self.canonical_text());
        metadata
    }
}

/// Canonical text for a path/description pair.
pub fn canonical_text(path: &str, description: &str) -> String {
    format!("Full Path: {}, Description: {}", path, description)
}

/// String form of a scalar JSON value, or `None` for arrays and objects.
///
/// The forms match what earlier tooling wrote into the index metadata:
/// `True`/`False` for booleans, `None` for null, and floats in shortest
/// round-trip form: positional with at least one decimal place (`3.0`,
/// `0.0001`), or exponent form (`5e-05`, `1.5e+16`) when the decimal exponent
/// is below -4 or at least 16.
pub fn stringify(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some("True".to_string()),
        Value::Bool(false) => Some("False".to_string()),
        Value::Null => Some("None".to_string()),
        Value::Number(n) => Some(number_to_string(n)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Like [`stringify`], but renders non-scalars as compact JSON.
///
/// Used for metadata read back from the remote index, which is never
/// rejected.
pub fn stringify_lossy(value: &Value) -> String {
    stringify(value).unwrap_or_else(|| value.to_string())
}

fn number_to_string(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() => float_to_string(f),
        _ => n.to_string(),
    }
}

fn float_to_string(f: f64) -> String {
    // `{:e}` gives the shortest round-trip digits as `<mantissa>e<exp>`.
    let sci = format!("{:e}", f);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if !(-4..16).contains(&exp) {
        return format!("{}e{:+03}", mantissa, exp);
    }
    let positional = format!("{}", f);
    if positional.contains('.') {
        positional
    } else {
        format!("{}.0", positional)
    }
}

/// An item as stored in the remote vector index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl RemoteItem {
    /// The stored canonical text, or `""` when absent.
    pub fn raw_string(&self) -> &str {
        self.metadata
            .get(RAW_STRING_KEY)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// One item of an upsert request.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertItem {
    pub id: String,
    pub vector: Vec<f32>,
    pub metadata: BTreeMap<String, String>,
}

/// Index-wide statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub total_count: u64,
}

/// One page of a paginated id listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub ids: Vec<String>,
    pub next_token: Option<String>,
}

/// What the applier must do for one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Add => "add",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// `Add` and `Update` both become an upsert.
    pub fn is_upsert(&self) -> bool {
        matches!(self, Action::Add | Action::Update)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    /// Case-sensitive: only `add`, `update`, `delete`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Action::Add),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(other.to_string()),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: String,
    pub action: Action,
}

impl ChangeEntry {
    pub fn new(id: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            action,
        }
    }
}
