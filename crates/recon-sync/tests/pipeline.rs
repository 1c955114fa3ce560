use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use recon_adapters::MappingRegistry;
use recon_core::{BaseSchema, RecordOutcome, SchemaField, StoredRecord, TableSchema};
use recon_storage::{
    AirtableConfig, LookupError, LookupTransport, Notifier, RawResponse, RecordStore, RetryPolicy,
    StoreError,
};
use recon_sync::{latest_report, Environment, SyncConfig, SyncPipeline};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

const TEST_FIELDS: &[(&str, &str)] = &[
    ("fldDinColumn00000", "DIN"),
    ("fldyqHiZfLHnQnNG7", "Facility"),
    ("fldVdinPD2V8dpGQb", "Next Parole Hearing"),
    ("fldw3U5tFxdrplE9G", "Latest Release Date"),
    ("fldGavIgPLs4s86Gv", "Sentence"),
    ("fldfz22m7Ir1vuGWs", "County"),
    ("fldD55NmNGqxFsrM4", "Race"),
    ("fldEIcJuHrhPpqeAd", "Hearing Or Release Type"),
    ("fldgrSCo1R7KkW6ve", "Parole Eligibility Date"),
    ("fldRit0cX7JknMNcA", "Earliest Release Date"),
    ("fldSNGnkmWfUDItaJ", "Date Of Birth"),
];

struct MemoryStore {
    records: Mutex<Vec<StoredRecord>>,
    writes: Mutex<Vec<String>>,
    reject: HashSet<String>,
}

impl MemoryStore {
    fn new(records: Vec<StoredRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            writes: Mutex::new(Vec::new()),
            reject: HashSet::new(),
        }
    }

    fn rejecting(mut self, record_id: &str) -> Self {
        self.reject.insert(record_id.to_string());
        self
    }

    fn field(&self, record_id: &str, name: &str) -> Option<Value> {
        let records = self.records.lock().unwrap();
        records.iter().find(|r| r.id == record_id)?.get(name).cloned()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_records(&self, _view: Option<&str>) -> Result<Vec<StoredRecord>, StoreError> {
        Ok(self.records.lock().unwrap().clone())
    }

    async fn update_record(
        &self,
        record_id: &str,
        fields: Map<String, Value>,
        _typecast: bool,
    ) -> Result<(), StoreError> {
        self.writes.lock().unwrap().push(record_id.to_string());
        if self.reject.contains(record_id) {
            return Err(StoreError::HttpStatus {
                status: 422,
                body: "INVALID_MULTIPLE_CHOICE_OPTIONS".into(),
            });
        }
        if let Some(record) = self.records.lock().unwrap().iter_mut().find(|r| r.id == record_id) {
            record.fields.extend(fields);
        }
        Ok(())
    }

    async fn fetch_schema(&self) -> Result<BaseSchema, StoreError> {
        Ok(BaseSchema {
            tables: vec![TableSchema {
                id: "tblPeople".into(),
                name: "People".into(),
                fields: TEST_FIELDS
                    .iter()
                    .map(|(id, name)| SchemaField {
                        id: id.to_string(),
                        name: name.to_string(),
                        field_type: String::new(),
                    })
                    .collect(),
            }],
        })
    }
}

enum Scripted {
    Json(Value),
    Empty,
    Status(u16),
}

/// Plays each identifier's script in order and repeats the last step.
#[derive(Default)]
struct ScriptedLookup {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLookup {
    fn script(self, identifier: &str, steps: Vec<Scripted>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(identifier.to_string(), steps.into());
        self
    }
}

#[async_trait]
impl LookupTransport for ScriptedLookup {
    async fn lookup(&self, identifier: &str) -> Result<RawResponse, LookupError> {
        self.calls.lock().unwrap().push(identifier.to_string());
        let mut scripts = self.scripts.lock().unwrap();
        let steps = scripts
            .get_mut(identifier)
            .ok_or_else(|| LookupError::EmptyResponse(format!("no script for {identifier}")))?;
        let step = if steps.len() > 1 {
            steps.pop_front()
        } else {
            None
        };
        let current = step.as_ref().or(steps.front());
        match current {
            Some(Scripted::Json(payload)) => Ok(RawResponse {
                status: 200,
                content_type: Some("application/json".into()),
                body: payload.to_string().into_bytes(),
            }),
            Some(Scripted::Status(status)) => Err(LookupError::HttpStatus {
                status: *status,
                message: "server error".into(),
            }),
            Some(Scripted::Empty) | None => Err(LookupError::EmptyResponse("empty body".into())),
        }
    }
}

#[derive(Default)]
struct SilentNotifier(Mutex<usize>);

#[async_trait]
impl Notifier for SilentNotifier {
    async fn send_preconfigured(&self, _text: &str) -> anyhow::Result<()> {
        *self.0.lock().unwrap() += 1;
        Ok(())
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn config(artifacts: &Path, enable_updates: bool) -> SyncConfig {
    SyncConfig {
        environment: Environment::Test,
        airtable: AirtableConfig {
            api_url: "http://127.0.0.1:9".into(),
            api_key: "key".into(),
            base_id: "appTest".into(),
            table_id: "tblPeople".into(),
        },
        airtable_view: None,
        identifier_field: "DIN".into(),
        lookup_url: "http://127.0.0.1:9".into(),
        batch_size: 3,
        batch_delay: Duration::ZERO,
        record_limit: None,
        shuffle_records: true,
        enable_updates,
        enable_typecast: true,
        debug: false,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_factor: 2.0,
        },
        http_timeout_secs: 5,
        user_agent: "recon-sync-tests".into(),
        artifacts_dir: artifacts.to_path_buf(),
        workspace_root: workspace_root(),
        notify_webhook_url: None,
        trigger_token: None,
        scheduler_enabled: false,
        sync_cron: "0 0 6 * * *".into(),
        web_port: 0,
    }
}

fn pipeline(
    artifacts: &TempDir,
    enable_updates: bool,
    store: Arc<MemoryStore>,
    lookup: Arc<ScriptedLookup>,
) -> SyncPipeline {
    let config = config(artifacts.path(), enable_updates);
    let registry = MappingRegistry::from_workspace_root(&config.workspace_root, config.environment.as_str())
        .expect("shipped mappings load");
    SyncPipeline::with_components(config, registry, store, lookup, Arc::new(SilentNotifier::default()))
}

fn record(id: &str, fields: Value) -> StoredRecord {
    match fields {
        Value::Object(map) => StoredRecord::new(id, map),
        _ => panic!("record fields must be an object"),
    }
}

fn profile() -> Value {
    json!({
        "facility": "SING SING",
        "county": "KINGS",
        "race": "WHITE",
        "minSentence": "3 years, 2 months",
        "maxSentence": "10 years"
    })
}

#[tokio::test]
async fn second_run_finds_nothing_left_to_change() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(vec![
        record("rec1", json!({"DIN": "07A4571", "County": "Bronx"})),
        record("rec2", json!({"DIN": "08B1234"})),
    ]));
    let lookup = Arc::new(
        ScriptedLookup::default()
            .script("07A4571", vec![Scripted::Json(profile())])
            .script("08B1234", vec![Scripted::Json(json!({"county": "ERIE"}))]),
    );
    let pipeline = pipeline(&dir, true, store.clone(), lookup);

    let first = pipeline.run_once().await.unwrap();
    assert_eq!(first.by_outcome.get(&RecordOutcome::Changed), Some(&2));
    assert_eq!(store.field("rec1", "Facility"), Some(json!(["Sing Sing"])));
    assert_eq!(store.field("rec1", "Sentence"), Some(json!("3.17 - 10")));
    assert_eq!(store.field("rec2", "County"), Some(json!("Erie")));

    let second = pipeline.run_once().await.unwrap();
    assert_eq!(second.by_outcome.get(&RecordOutcome::NoChange), Some(&2));
    assert_eq!(second.by_outcome.get(&RecordOutcome::Changed), None);
    assert_eq!(store.writes.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn dry_run_reports_changes_without_writing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(vec![record("rec1", json!({"DIN": "07A4571"}))]));
    let lookup = Arc::new(ScriptedLookup::default().script("07A4571", vec![Scripted::Json(profile())]));
    let pipeline = pipeline(&dir, false, store.clone(), lookup);

    for _ in 0..2 {
        let summary = pipeline.run_once().await.unwrap();
        assert_eq!(summary.by_outcome.get(&RecordOutcome::Changed), Some(&1));
        assert!(!summary.updates_enabled);
    }
    assert!(store.writes.lock().unwrap().is_empty());
    assert_eq!(store.field("rec1", "Facility"), None);
}

#[tokio::test]
async fn disagreeing_mappings_on_a_shared_field_fail_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(vec![
        record("rec1", json!({"DIN": "07A4571"})),
        record("rec2", json!({"DIN": "08B1234"})),
    ]));
    let lookup = Arc::new(
        ScriptedLookup::default()
            .script(
                "07A4571",
                vec![Scripted::Json(json!({
                    "paroleHearingType": "Initial",
                    "earliestReleaseType": "Conditional Release"
                }))],
            )
            .script(
                "08B1234",
                vec![Scripted::Json(json!({
                    "paroleHearingType": "Initial",
                    "earliestReleaseType": "Initial"
                }))],
            ),
    );
    let pipeline = pipeline(&dir, true, store.clone(), lookup);

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.by_outcome.get(&RecordOutcome::ProcessingError), Some(&1));
    assert_eq!(summary.by_outcome.get(&RecordOutcome::Changed), Some(&1));
    assert_eq!(*store.writes.lock().unwrap(), vec!["rec2".to_string()]);
    assert_eq!(store.field("rec2", "Hearing Or Release Type"), Some(json!("Initial")));
}

#[tokio::test]
async fn empty_responses_are_retried_and_measured() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new(vec![
        record("rec1", json!({"DIN": "07A4571"})),
        record("rec2", json!({"DIN": "08B1234"})),
    ]));
    let lookup = Arc::new(
        ScriptedLookup::default()
            .script("07A4571", vec![Scripted::Empty, Scripted::Json(profile())])
            .script("08B1234", vec![Scripted::Empty]),
    );
    let pipeline = pipeline(&dir, true, store, lookup.clone());

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.by_outcome.get(&RecordOutcome::Changed), Some(&1));
    assert_eq!(summary.by_outcome.get(&RecordOutcome::EmptyResponse), Some(&1));

    let calls = lookup.calls.lock().unwrap().clone();
    assert_eq!(calls.iter().filter(|c| *c == "07A4571").count(), 2);
    assert_eq!(calls.iter().filter(|c| *c == "08B1234").count(), 3);

    let report = latest_report(dir.path()).await.unwrap().expect("report persisted");
    let network = &report["network_analysis"];
    assert_eq!(network["total_requests"], json!(5));
    assert_eq!(network["empty_responses"], json!(4));
    assert_eq!(network["successful_retries"], json!(1));
    // the final failed attempt of 08B1234 is not followed by a backoff
    assert_eq!(network["retry_attempts"], json!(3));
    assert_eq!(network["errors_by_type"]["EmptyResponseError"], json!(4));
}

#[tokio::test]
async fn every_record_lands_in_exactly_one_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        MemoryStore::new(vec![
            record("rec1", json!({"DIN": "07A4571"})),
            record("rec2", json!({"DIN": "not-a-din"})),
            record("rec3", json!({})),
            record("rec4", json!({"DIN": "08B1234"})),
            record("rec5", json!({"DIN": "09C0001"})),
            record("rec6", json!({"DIN": "10D0002", "County": "Erie"})),
            record("rec7", json!({"DIN": "11E0003"})),
        ])
        .rejecting("rec7"),
    );
    let lookup = Arc::new(
        ScriptedLookup::default()
            .script("07A4571", vec![Scripted::Json(profile())])
            .script("08B1234", vec![Scripted::Empty])
            .script("09C0001", vec![Scripted::Status(500)])
            .script("10D0002", vec![Scripted::Json(json!({"county": "ERIE"}))])
            .script("11E0003", vec![Scripted::Json(json!({"facility": "ATTICA"}))]),
    );
    let pipeline = pipeline(&dir, true, store, lookup.clone());

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.total_records, 7);
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.by_outcome.values().sum::<u64>(), 7);

    let report = latest_report(dir.path()).await.unwrap().expect("report persisted");
    let outcome = |id: &str| report["records"][id]["outcome"].as_str().unwrap().to_string();
    assert_eq!(outcome("rec1"), "CHANGED");
    assert_eq!(outcome("rec2"), "INVALID_IDENTIFIER");
    assert_eq!(outcome("rec3"), "INVALID_IDENTIFIER");
    assert_eq!(outcome("rec4"), "EMPTY_RESPONSE");
    assert_eq!(outcome("rec5"), "ERROR_RESPONSE");
    assert_eq!(outcome("rec6"), "NO_CHANGE");
    assert_eq!(outcome("rec7"), "UPDATE_FAILED");

    // invalid identifiers never reach the lookup service, other errors are not retried
    let calls = lookup.calls.lock().unwrap().clone();
    assert!(!calls.iter().any(|c| c == "not-a-din"));
    assert_eq!(calls.iter().filter(|c| *c == "09C0001").count(), 1);
}

#[tokio::test]
async fn record_limit_caps_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let records = (0..12)
        .map(|i| record(&format!("rec{i:02}"), json!({"DIN": format!("07A{:04}", i)})))
        .collect();
    let store = Arc::new(MemoryStore::new(records));
    let mut config = config(dir.path(), false);
    config.record_limit = Some(5);
    let registry = MappingRegistry::from_workspace_root(&config.workspace_root, "test").unwrap();
    let pipeline = SyncPipeline::with_components(
        config,
        registry,
        store,
        Arc::new(ScriptedLookup::default()),
        Arc::new(SilentNotifier::default()),
    );

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.total_records, 5);
    assert_eq!(summary.batches, 2);
}

/// Records when each lookup started and finished.
#[derive(Default)]
struct TimedLookup {
    spans: Mutex<Vec<(String, Instant, Instant)>>,
}

#[async_trait]
impl LookupTransport for TimedLookup {
    async fn lookup(&self, identifier: &str) -> Result<RawResponse, LookupError> {
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.spans
            .lock()
            .unwrap()
            .push((identifier.to_string(), started, Instant::now()));
        Ok(RawResponse {
            status: 200,
            content_type: Some("application/json".into()),
            body: b"{}".to_vec(),
        })
    }
}

#[tokio::test]
async fn batches_never_overlap_and_pause_between() {
    let dir = tempfile::tempdir().unwrap();
    let identifiers = (0..7).map(|i| format!("07A{:04}", i)).collect::<Vec<_>>();
    let records = identifiers
        .iter()
        .enumerate()
        .map(|(i, din)| record(&format!("rec{i}"), json!({"DIN": din})))
        .collect();
    let mut config = config(dir.path(), false);
    config.shuffle_records = false;
    config.batch_delay = Duration::from_millis(50);
    let registry = MappingRegistry::from_workspace_root(&config.workspace_root, "test").unwrap();
    let lookup = Arc::new(TimedLookup::default());
    let pipeline = SyncPipeline::with_components(
        config,
        registry,
        Arc::new(MemoryStore::new(records)),
        lookup.clone(),
        Arc::new(SilentNotifier::default()),
    );

    let summary = pipeline.run_once().await.unwrap();
    assert_eq!(summary.batches, 3);
    assert_eq!(summary.by_outcome.get(&RecordOutcome::NoChange), Some(&7));

    let spans = lookup.spans.lock().unwrap().clone();
    let batch_of = |id: &str| identifiers.iter().position(|d| d == id).unwrap() / 3;
    for batch in 1..3 {
        let previous_end = spans
            .iter()
            .filter(|(id, _, _)| batch_of(id) == batch - 1)
            .map(|(_, _, end)| *end)
            .max()
            .unwrap();
        let next_start = spans
            .iter()
            .filter(|(id, _, _)| batch_of(id) == batch)
            .map(|(_, start, _)| *start)
            .min()
            .unwrap();
        assert!(next_start >= previous_end + Duration::from_millis(50));
    }
}
