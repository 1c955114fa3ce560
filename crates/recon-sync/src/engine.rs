//! Per-record reconciliation: validate, fetch, diff, update, classify.

use std::sync::Arc;

use recon_adapters::{
    validate_type, LookupAdapter, MappingError, ResolvedMapping, ResolvedRegistry, SourceValue,
};
use recon_core::{validate_identifier, Change, RecordOutcome, StoredRecord};
use recon_storage::RecordStore;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::report::SharedReport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// When false, changes are computed and reported but never written.
    pub enable_updates: bool,
    pub typecast: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum ProcessingError {
    #[error("conflicting updates for field {field}: {first} vs {second}")]
    ConflictingChanges {
        field: String,
        first: Value,
        second: Value,
    },
}

/// Terminal result of one record, as written to the report.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub outcome: RecordOutcome,
    pub message: String,
    pub changes: Vec<Change>,
}

impl Reconciliation {
    fn new(outcome: RecordOutcome, message: impl Into<String>, changes: Vec<Change>) -> Self {
        Self {
            outcome,
            message: message.into(),
            changes,
        }
    }
}

pub struct Reconciler {
    registry: Arc<ResolvedRegistry>,
    lookup: LookupAdapter,
    store: Arc<dyn RecordStore>,
    identifier_field: String,
    options: UpdateOptions,
}

impl Reconciler {
    pub fn new(
        registry: Arc<ResolvedRegistry>,
        lookup: LookupAdapter,
        store: Arc<dyn RecordStore>,
        identifier_field: impl Into<String>,
        options: UpdateOptions,
    ) -> Self {
        Self {
            registry,
            lookup,
            store,
            identifier_field: identifier_field.into(),
            options,
        }
    }

    pub fn identifier_of(&self, record: &StoredRecord) -> String {
        match record.get(&self.identifier_field) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    /// Reconcile one record and add exactly one entry for it to `report`.
    pub async fn reconcile(&self, record: &StoredRecord, report: &SharedReport) -> RecordOutcome {
        let identifier = self.identifier_of(record);
        let result = self.run(record, &identifier, report).await;
        let outcome = result.outcome;
        report.with(|r| r.add_record(&record.id, &identifier, outcome, result.message, result.changes));
        outcome
    }

    async fn run(&self, record: &StoredRecord, identifier: &str, report: &SharedReport) -> Reconciliation {
        if !validate_identifier(identifier) {
            debug!(record_id = %record.id, identifier, "invalid identifier");
            return Reconciliation::new(
                RecordOutcome::InvalidIdentifier,
                format!("invalid identifier {identifier:?}"),
                Vec::new(),
            );
        }

        let payload = match self.lookup.fetch_external(identifier, report).await {
            Ok(payload) => Value::Object(payload),
            Err(failure) => {
                return Reconciliation::new(failure.kind.outcome(), failure.message, Vec::new());
            }
        };

        let changes = self.compute_changes(record, identifier, &payload);
        if changes.is_empty() {
            return Reconciliation::new(RecordOutcome::NoChange, "", changes);
        }

        let fields = match update_fields(&changes) {
            Ok(fields) => fields,
            Err(err) => {
                warn!(record_id = %record.id, identifier, error = %err, "record processing failed");
                return Reconciliation::new(RecordOutcome::ProcessingError, err.to_string(), changes);
            }
        };

        if !self.options.enable_updates {
            info!(identifier, changes = changes.len(), "updates disabled, not writing");
            return Reconciliation::new(RecordOutcome::Changed, "dry run: updates disabled", changes);
        }

        match self
            .store
            .update_record(&record.id, fields, self.options.typecast)
            .await
        {
            Ok(()) => {
                info!(identifier, changes = changes.len(), "record updated");
                Reconciliation::new(RecordOutcome::Changed, "", changes)
            }
            Err(err) => {
                warn!(record_id = %record.id, identifier, error = %err, "record update failed");
                Reconciliation::new(RecordOutcome::UpdateFailed, err.to_string(), changes)
            }
        }
    }

    /// Diff every mapped field. A field that fails is logged and skipped.
    pub fn compute_changes(&self, record: &StoredRecord, identifier: &str, payload: &Value) -> Vec<Change> {
        let mut changes = Vec::new();
        for entry in self.registry.entries() {
            let Some(source) = entry.mapping.source_value(payload) else {
                continue;
            };
            match diff_field(entry, record.get(&entry.field_name), &source) {
                Ok(Some(change)) => changes.push(change),
                Ok(None) => {}
                Err(err) => warn!(
                    identifier,
                    field = %entry.field_name,
                    error = %err,
                    "skipping field"
                ),
            }
        }
        changes
    }
}

fn diff_field(
    entry: &ResolvedMapping,
    stored: Option<&Value>,
    source: &SourceValue,
) -> Result<Option<Change>, MappingError> {
    let mapping = &entry.mapping;
    if mapping.compare(stored, source)? {
        return Ok(None);
    }
    let new_value = mapping.transform(source)?;
    validate_type(&entry.field_name, &new_value, mapping.field_type)?;
    Ok(Some(Change {
        field: entry.field_name.clone(),
        old_value: stored.cloned().unwrap_or(Value::Null),
        new_value,
    }))
}

/// Collapse a record's changes into one write. Two mappings may share a target
/// field only if they agree on its value.
fn update_fields(changes: &[Change]) -> Result<Map<String, Value>, ProcessingError> {
    let mut fields = Map::new();
    for change in changes {
        if let Some(existing) = fields.get(&change.field) {
            if *existing != change.new_value {
                return Err(ProcessingError::ConflictingChanges {
                    field: change.field.clone(),
                    first: existing.clone(),
                    second: change.new_value.clone(),
                });
            }
            continue;
        }
        fields.insert(change.field.clone(), change.new_value.clone());
    }
    Ok(fields)
}
