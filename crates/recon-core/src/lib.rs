//! Core domain model for record reconciliation.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CRATE_NAME: &str = "recon-core";

/// Terminal classification of one record in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordOutcome {
    InvalidIdentifier,
    ErrorResponse,
    EmptyResponse,
    ProcessingError,
    NoChange,
    Changed,
    UpdateFailed,
}

impl RecordOutcome {
    pub const ALL: [RecordOutcome; 7] = [
        RecordOutcome::InvalidIdentifier,
        RecordOutcome::ErrorResponse,
        RecordOutcome::EmptyResponse,
        RecordOutcome::ProcessingError,
        RecordOutcome::NoChange,
        RecordOutcome::Changed,
        RecordOutcome::UpdateFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordOutcome::InvalidIdentifier => "INVALID_IDENTIFIER",
            RecordOutcome::ErrorResponse => "ERROR_RESPONSE",
            RecordOutcome::EmptyResponse => "EMPTY_RESPONSE",
            RecordOutcome::ProcessingError => "PROCESSING_ERROR",
            RecordOutcome::NoChange => "NO_CHANGE",
            RecordOutcome::Changed => "CHANGED",
            RecordOutcome::UpdateFailed => "UPDATE_FAILED",
        }
    }
}

impl fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid outcome: {0}")]
pub struct InvalidOutcome(pub String);

impl FromStr for RecordOutcome {
    type Err = InvalidOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RecordOutcome::ALL
            .into_iter()
            .find(|o| o.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| InvalidOutcome(s.to_string()))
    }
}

/// Declared value type of a target-store field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    MultiSelect,
    Date,
    Text,
    Boolean,
    Number,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::MultiSelect => "multi_select",
            FieldType::Date => "date",
            FieldType::Text => "text",
            FieldType::Boolean => "boolean",
            FieldType::Number => "number",
        };
        f.write_str(name)
    }
}

/// A proposed field update, produced only when stored and source values disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub field: String,
    pub old_value: Value,
    pub new_value: Value,
}

/// One row read from the tabular store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl StoredRecord {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field_name: &str) -> Option<&Value> {
        self.fields.get(field_name)
    }

    pub fn get_str(&self, field_name: &str) -> Option<&str> {
        self.get(field_name).and_then(Value::as_str)
    }
}

/// Live schema of the tabular store, as returned by its metadata endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseSchema {
    pub tables: Vec<TableSchema>,
}

impl BaseSchema {
    pub fn table(&self, table_id: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.id == table_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub fields: Vec<SchemaField>,
}

impl TableSchema {
    pub fn field_name(&self, field_id: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.id == field_id)
            .map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: String,
}

static IDENTIFIER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{2}[A-Za-z]\d{4}$").expect("identifier pattern compiles"));

/// A valid identifier is two digits, one letter (either case), then four digits.
pub fn validate_identifier(identifier: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(identifier)
}

/// Values that never overwrite a stored value: null, false, zero, and blank strings.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().map(|f| f == 0.0 || f.is_nan()).unwrap_or(false),
        Value::String(s) => s.trim().is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifier_shape_is_enforced() {
        assert!(validate_identifier("07A4571"));
        assert!(validate_identifier("99z0000"));
        assert!(!validate_identifier("7A4571"));
        assert!(!validate_identifier("07AA4571"));
        assert!(!validate_identifier("ABA4571"));
        assert!(!validate_identifier("07A45712"));
        assert!(!validate_identifier(" 07A4571"));
        assert!(!validate_identifier(""));
    }

    #[test]
    fn outcome_round_trips_through_wire_name() {
        for outcome in RecordOutcome::ALL {
            assert_eq!(outcome.as_str().parse::<RecordOutcome>(), Ok(outcome));
            let encoded = serde_json::to_value(outcome).unwrap();
            assert_eq!(encoded, json!(outcome.as_str()));
        }
        assert_eq!(
            "SOMETHING_ELSE".parse::<RecordOutcome>(),
            Err(InvalidOutcome("SOMETHING_ELSE".into()))
        );
    }

    #[test]
    fn empty_values_follow_falsy_policy() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!("")));
        assert!(is_empty_value(&json!("   ")));
        assert!(is_empty_value(&json!(false)));
        assert!(is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!("x")));
        assert!(!is_empty_value(&json!(3)));
        assert!(!is_empty_value(&json!([])));
    }

    #[test]
    fn schema_lookup_by_field_id() {
        let schema: BaseSchema = serde_json::from_value(json!({
            "tables": [{
                "id": "tbl1",
                "name": "People",
                "fields": [
                    {"id": "fldA", "name": "County", "type": "singleLineText"},
                    {"id": "fldB", "name": "Facility", "type": "multipleSelects"}
                ]
            }]
        }))
        .unwrap();
        let table = schema.table("tbl1").unwrap();
        assert_eq!(table.field_name("fldB"), Some("Facility"));
        assert_eq!(table.field_name("fldZ"), None);
        assert!(schema.table("tbl2").is_none());
    }
}
