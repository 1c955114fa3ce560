//! Declarative field mapping registry.
//!
//! Each logical field names the lookup key(s) it reads, the target-store field
//! it writes, the declared value type of that field, and a [`MappingRule`]
//! that decides equality and produces the canonical value to write.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use recon_core::{is_empty_value, FieldType, TableSchema};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::normalize::{duration_to_years, normalize_date, title_case};

pub const DEFAULT_MAPPINGS_FILE: &str = "config/field_mappings.yaml";

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("field mapping not found for {field_id}")]
    FieldMappingNotFound { field_id: String },
    #[error("{field}: value {value} is not a valid {expected}")]
    DataType {
        field: String,
        value: Value,
        expected: FieldType,
    },
    #[error("{key}: rule {rule:?} cannot produce a {declared} value")]
    InconsistentRule {
        key: String,
        rule: MappingRule,
        declared: FieldType,
    },
    #[error("{key}: rule {rule:?} cannot read source {detail}")]
    SourceShape {
        key: String,
        rule: MappingRule,
        detail: String,
    },
    #[error("no field mappings declared for environment {0}")]
    UnknownEnvironment(String),
    #[error("duplicate mapping key {0}")]
    DuplicateKey(String),
    #[error("invalid mappings document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Comparison/transform strategy of one mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingRule {
    /// Stored list must contain the title-cased source; writes a one-item list.
    TitleCasedMultiSelect,
    /// Source date in `MM/DD/YYYY`-like form, compared as `YYYY-MM-DD`.
    IsoDate,
    /// Two duration fields rendered as `"<min> - <max>"` decimal years.
    ComputedRange,
    TitleCasedText,
    PlainText,
}

/// Source value assembled for one mapping: one key, or every `required_fields` key.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Single(Value),
    Composite(BTreeMap<String, Value>),
}

impl SourceValue {
    pub fn is_empty(&self) -> bool {
        match self {
            SourceValue::Single(v) => is_empty_value(v),
            SourceValue::Composite(parts) => parts.values().all(is_empty_value),
        }
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

impl MappingRule {
    pub fn produces(&self, declared: FieldType) -> bool {
        match self {
            MappingRule::TitleCasedMultiSelect => declared == FieldType::MultiSelect,
            MappingRule::IsoDate => declared == FieldType::Date,
            MappingRule::ComputedRange | MappingRule::TitleCasedText | MappingRule::PlainText => {
                declared == FieldType::Text
            }
        }
    }

    fn single_text(&self, key: &str, source: &SourceValue) -> Result<String, MappingError> {
        match source {
            SourceValue::Single(v) => value_text(v).ok_or_else(|| MappingError::SourceShape {
                key: key.to_string(),
                rule: *self,
                detail: format!("non-scalar value {v}"),
            }),
            SourceValue::Composite(_) => Err(MappingError::SourceShape {
                key: key.to_string(),
                rule: *self,
                detail: "composite value".to_string(),
            }),
        }
    }

    fn range_text(
        &self,
        key: &str,
        source: &SourceValue,
        required: &[String],
    ) -> Result<String, MappingError> {
        let SourceValue::Composite(parts) = source else {
            return Err(MappingError::SourceShape {
                key: key.to_string(),
                rule: *self,
                detail: "single value where two bounds are required".to_string(),
            });
        };
        let [lower_key, upper_key] = required else {
            return Err(MappingError::SourceShape {
                key: key.to_string(),
                rule: *self,
                detail: format!("{} required fields, expected 2", required.len()),
            });
        };
        let bound = |k: &String| {
            parts
                .get(k)
                .and_then(value_text)
                .map(|t| duration_to_years(&t))
                .unwrap_or_default()
        };
        Ok(format!("{} - {}", bound(lower_key), bound(upper_key)))
    }

    /// Canonical value to write for `source`.
    pub fn transform(&self, mapping: &FieldMapping, source: &SourceValue) -> Result<Value, MappingError> {
        let key = mapping.key.as_str();
        Ok(match self {
            MappingRule::TitleCasedMultiSelect => json!([title_case(&self.single_text(key, source)?)]),
            MappingRule::IsoDate => json!(normalize_date(&self.single_text(key, source)?)),
            MappingRule::ComputedRange => json!(self.range_text(key, source, mapping.required_fields())?),
            MappingRule::TitleCasedText => json!(title_case(&self.single_text(key, source)?)),
            MappingRule::PlainText => json!(self.single_text(key, source)?),
        })
    }

    /// True when `stored` already agrees with `source`.
    pub fn compare(
        &self,
        mapping: &FieldMapping,
        stored: Option<&Value>,
        source: &SourceValue,
    ) -> Result<bool, MappingError> {
        let expected = self.transform(mapping, source)?;
        Ok(match self {
            MappingRule::TitleCasedMultiSelect => {
                let wanted = expected.get(0).cloned().unwrap_or(Value::Null);
                match stored {
                    Some(Value::Array(items)) => items.contains(&wanted),
                    _ => false,
                }
            }
            // an unparseable source date proposes nothing
            MappingRule::IsoDate if expected == json!("") => true,
            _ => stored == Some(&expected),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKeys {
    Single(String),
    Required(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldMapping {
    pub key: String,
    pub source: SourceKeys,
    pub field_id: String,
    pub field_type: FieldType,
    pub rule: MappingRule,
    pub cause_alert: bool,
}

impl FieldMapping {
    pub fn required_fields(&self) -> &[String] {
        match &self.source {
            SourceKeys::Single(_) => &[],
            SourceKeys::Required(keys) => keys,
        }
    }

    /// Pull this mapping's source value out of a lookup payload; `None` when empty.
    pub fn source_value(&self, payload: &Value) -> Option<SourceValue> {
        let value = match &self.source {
            SourceKeys::Single(key) => SourceValue::Single(payload.get(key).cloned().unwrap_or(Value::Null)),
            SourceKeys::Required(keys) => SourceValue::Composite(
                keys.iter()
                    .map(|k| (k.clone(), payload.get(k).cloned().unwrap_or(Value::Null)))
                    .collect(),
            ),
        };
        (!value.is_empty()).then_some(value)
    }

    pub fn compare(&self, stored: Option<&Value>, source: &SourceValue) -> Result<bool, MappingError> {
        self.rule.compare(self, stored, source)
    }

    pub fn transform(&self, source: &SourceValue) -> Result<Value, MappingError> {
        self.rule.transform(self, source)
    }
}

/// Check a produced value against the declared type of its target field.
pub fn validate_type(field_name: &str, value: &Value, expected: FieldType) -> Result<(), MappingError> {
    let ok = match expected {
        FieldType::MultiSelect => value
            .as_array()
            .map(|items| items.iter().all(Value::is_string))
            .unwrap_or(false),
        FieldType::Date => value
            .as_str()
            .map(|s| s.is_empty() || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok())
            .unwrap_or(false),
        FieldType::Text => value.is_string(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Number => value.is_number(),
    };
    if ok {
        Ok(())
    } else {
        Err(MappingError::DataType {
            field: field_name.to_string(),
            value: value.clone(),
            expected,
        })
    }
}

#[derive(Debug, Deserialize)]
struct MappingsDocument {
    #[allow(dead_code)]
    version: u32,
    environments: BTreeMap<String, Vec<MappingEntry>>,
}

#[derive(Debug, Deserialize)]
struct MappingEntry {
    key: String,
    field_id: String,
    #[serde(rename = "type")]
    field_type: FieldType,
    rule: MappingRule,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    required_fields: Vec<String>,
    #[serde(default)]
    cause_alert: bool,
}

/// Ordered mappings for one environment, not yet checked against the live schema.
#[derive(Debug, Clone)]
pub struct MappingRegistry {
    environment: String,
    mappings: Vec<FieldMapping>,
}

impl MappingRegistry {
    pub fn from_yaml_str(yaml: &str, environment: &str) -> Result<Self, MappingError> {
        let mut doc: MappingsDocument = serde_yaml::from_str(yaml)?;
        let entries = doc
            .environments
            .remove(environment)
            .ok_or_else(|| MappingError::UnknownEnvironment(environment.to_string()))?;

        let mut seen = BTreeSet::new();
        let mut mappings = Vec::with_capacity(entries.len());
        for entry in entries {
            if !seen.insert(entry.key.clone()) {
                return Err(MappingError::DuplicateKey(entry.key));
            }
            if !entry.rule.produces(entry.field_type) {
                return Err(MappingError::InconsistentRule {
                    key: entry.key,
                    rule: entry.rule,
                    declared: entry.field_type,
                });
            }
            let source = if entry.required_fields.is_empty() {
                SourceKeys::Single(entry.source.unwrap_or_else(|| entry.key.clone()))
            } else {
                SourceKeys::Required(entry.required_fields)
            };
            mappings.push(FieldMapping {
                key: entry.key,
                source,
                field_id: entry.field_id,
                field_type: entry.field_type,
                rule: entry.rule,
                cause_alert: entry.cause_alert,
            });
        }

        Ok(Self {
            environment: environment.to_string(),
            mappings,
        })
    }

    pub fn from_workspace_root(root: &Path, environment: &str) -> anyhow::Result<Self> {
        let path = root.join(DEFAULT_MAPPINGS_FILE);
        let yaml = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&yaml, environment).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn get_mapping(&self, key: &str) -> Option<&FieldMapping> {
        self.mappings.iter().find(|m| m.key == key)
    }

    pub fn all_mappings(&self) -> impl Iterator<Item = (&str, &FieldMapping)> {
        self.mappings.iter().map(|m| (m.key.as_str(), m))
    }

    /// Bind every mapping to a live field name. Any unresolved field id is fatal.
    pub fn resolve(self, table: &TableSchema) -> Result<ResolvedRegistry, MappingError> {
        let mut entries = Vec::with_capacity(self.mappings.len());
        for mapping in self.mappings {
            let field_name = table
                .field_name(&mapping.field_id)
                .ok_or_else(|| MappingError::FieldMappingNotFound {
                    field_id: mapping.field_id.clone(),
                })?
                .to_string();
            entries.push(ResolvedMapping { mapping, field_name });
        }
        Ok(ResolvedRegistry {
            environment: self.environment,
            entries,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    pub mapping: FieldMapping,
    pub field_name: String,
}

/// Registry whose every mapping is known to exist in the live store schema.
#[derive(Debug, Clone)]
pub struct ResolvedRegistry {
    environment: String,
    entries: Vec<ResolvedMapping>,
}

impl ResolvedRegistry {
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn entries(&self) -> &[ResolvedMapping] {
        &self.entries
    }

    pub fn get_mapping(&self, key: &str) -> Option<&ResolvedMapping> {
        self.entries.iter().find(|e| e.mapping.key == key)
    }

    pub fn resolve_target_field_name(&self, field_id: &str) -> Result<&str, MappingError> {
        self.entries
            .iter()
            .find(|e| e.mapping.field_id == field_id)
            .map(|e| e.field_name.as_str())
            .ok_or_else(|| MappingError::FieldMappingNotFound {
                field_id: field_id.to_string(),
            })
    }

    /// Field names whose changes should reach a human.
    pub fn alert_fields(&self) -> BTreeSet<&str> {
        self.entries
            .iter()
            .filter(|e| e.mapping.cause_alert)
            .map(|e| e.field_name.as_str())
            .collect()
    }
}
