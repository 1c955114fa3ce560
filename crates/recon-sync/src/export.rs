//! Parquet snapshots of a finished run for offline analysis.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use recon_storage::{ArtifactStore, SaveOptions};
use serde::{Deserialize, Serialize};

use crate::report::{display_value, Report};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: u64,
}

fn encode_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None).context("opening parquet writer")?;
    writer.write(batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

fn string_column<T>(rows: &[T], value: impl Fn(&T) -> String) -> StringArray {
    StringArray::from(rows.iter().map(|r| Some(value(r))).collect::<Vec<_>>())
}

fn outcomes_batch(report: &Report) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("identifier", DataType::Utf8, false),
        ArrowField::new("outcome", DataType::Utf8, false),
        ArrowField::new("message", DataType::Utf8, true),
        ArrowField::new("change_count", DataType::UInt32, false),
        ArrowField::new("timestamp", DataType::Utf8, false),
    ]));

    let entries = report.records.iter().collect::<Vec<_>>();
    let record_ids = StringArray::from(entries.iter().map(|(id, _)| Some(id.as_str())).collect::<Vec<_>>());
    let identifiers = StringArray::from(
        entries
            .iter()
            .map(|(_, e)| Some(e.identifier.as_str()))
            .collect::<Vec<_>>(),
    );
    let outcomes = StringArray::from(entries.iter().map(|(_, e)| Some(e.outcome.as_str())).collect::<Vec<_>>());
    let messages = StringArray::from(
        entries
            .iter()
            .map(|(_, e)| (!e.message.is_empty()).then_some(e.message.as_str()))
            .collect::<Vec<_>>(),
    );
    let change_counts = UInt32Array::from(
        entries
            .iter()
            .map(|(_, e)| e.changes.len() as u32)
            .collect::<Vec<_>>(),
    );
    let timestamps = StringArray::from(
        entries
            .iter()
            .map(|(_, e)| Some(e.timestamp.to_rfc3339()))
            .collect::<Vec<_>>(),
    );

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(record_ids),
            Arc::new(identifiers),
            Arc::new(outcomes),
            Arc::new(messages),
            Arc::new(change_counts),
            Arc::new(timestamps),
        ],
    )
    .context("building outcomes record batch")
}

fn changes_batch(report: &Report) -> Result<RecordBatch> {
    let rows = report
        .records
        .iter()
        .flat_map(|(id, entry)| {
            entry
                .changes
                .iter()
                .map(move |c| (id.as_str(), entry.identifier.as_str(), entry.outcome.as_str(), c))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("record_id", DataType::Utf8, false),
        ArrowField::new("identifier", DataType::Utf8, false),
        ArrowField::new("outcome", DataType::Utf8, false),
        ArrowField::new("field", DataType::Utf8, false),
        ArrowField::new("old_value", DataType::Utf8, false),
        ArrowField::new("new_value", DataType::Utf8, false),
    ]));
    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(string_column(&rows, |r| r.0.to_string())),
            Arc::new(string_column(&rows, |r| r.1.to_string())),
            Arc::new(string_column(&rows, |r| r.2.to_string())),
            Arc::new(string_column(&rows, |r| r.3.field.clone())),
            Arc::new(string_column(&rows, |r| display_value(&r.3.old_value))),
            Arc::new(string_column(&rows, |r| display_value(&r.3.new_value))),
        ],
    )
    .context("building changes record batch")
}

/// Write `outcomes.parquet`, `changes.parquet` and `manifest.json` under `dir`.
pub async fn export_parquet_snapshot(
    store: &ArtifactStore,
    dir: &Path,
    report: &Report,
    metadata: BTreeMap<String, String>,
) -> Result<PathBuf> {
    let mut files = Vec::new();
    for (name, batch) in [("outcomes", outcomes_batch(report)?), ("changes", changes_batch(report)?)] {
        let bytes = encode_parquet(&batch).with_context(|| format!("encoding {name}.parquet"))?;
        let relative = dir.join(format!("{name}.parquet"));
        let saved = store
            .save(
                &relative,
                &bytes,
                SaveOptions {
                    content_type: None,
                    metadata: metadata.clone(),
                },
            )
            .await
            .with_context(|| format!("saving {}", relative.display()))?;
        files.push(ParquetManifestFile {
            name: name.to_string(),
            path: format!("{name}.parquet"),
            sha256: saved.content_hash,
            bytes: saved.byte_size as u64,
            rows: batch.num_rows() as u64,
        });
    }

    let manifest = ParquetManifest {
        schema_version: 1,
        files,
    };
    let manifest_path = dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    let saved = store
        .save(
            &manifest_path,
            &bytes,
            SaveOptions {
                content_type: None,
                metadata,
            },
        )
        .await
        .with_context(|| format!("saving {}", manifest_path.display()))?;
    Ok(saved.absolute_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use recon_core::{Change, RecordOutcome};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn snapshot_writes_both_tables_and_manifest() {
        let mut report = Report::new();
        report.add_record(
            "rec1",
            "07A4571",
            RecordOutcome::Changed,
            "",
            vec![
                Change {
                    field: "County".into(),
                    old_value: json!("Bronx"),
                    new_value: json!("Kings"),
                },
                Change {
                    field: "Facility".into(),
                    old_value: json!(["Attica"]),
                    new_value: json!(["Sing Sing"]),
                },
            ],
        );
        report.add_record("rec2", "bad", RecordOutcome::InvalidIdentifier, "invalid identifier", vec![]);

        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let manifest_path = export_parquet_snapshot(
            &store,
            Path::new("snapshots/test-20260301T060000Z"),
            &report,
            BTreeMap::new(),
        )
        .await
        .expect("export");

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].rows, 2);
        assert_eq!(manifest.files[1].rows, 2);

        let changes = std::fs::File::open(dir.path().join("snapshots/test-20260301T060000Z/changes.parquet")).unwrap();
        let reader = SerializedFileReader::new(changes).unwrap();
        assert_eq!(reader.metadata().file_metadata().num_rows(), 2);

        let meta = store
            .read_metadata("snapshots/test-20260301T060000Z/outcomes.parquet")
            .await
            .unwrap();
        assert_eq!(meta.sha256, manifest.files[0].sha256);
    }
}
