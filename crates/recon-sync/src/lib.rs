//! Reconciliation run orchestration.
//!
//! A run resolves the field mappings against the live store schema, lists the
//! records once, reconciles them batch by batch into a fresh [`Report`], then
//! persists the report artifacts and notifies staff.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use recon_adapters::{LookupAdapter, MappingRegistry, ResolvedRegistry};
use recon_core::{RecordOutcome, StoredRecord};
use recon_storage::{
    AirtableClient, ArtifactStore, HttpLookupTransport, LogNotifier, LookupTransport, Notifier,
    RecordStore, SaveOptions, WebhookNotifier,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod batch;
pub mod config;
pub mod engine;
pub mod export;
pub mod report;

pub use batch::{batch_ranges, run_batches, BatchRunStats};
pub use config::{ConfigError, Environment, SyncConfig};
pub use engine::{Reconciler, Reconciliation, UpdateOptions};
pub use export::{export_parquet_snapshot, ParquetManifest, ParquetManifestFile};
pub use report::{NetworkAnalysis, Report, ReportError, SharedReport, SummarySnapshot};

pub const CRATE_NAME: &str = "recon-sync";

pub const JSON_REPORTS_DIR: &str = "reports";
pub const STAFF_REPORTS_DIR: &str = "staff-reports";
pub const SNAPSHOTS_DIR: &str = "snapshots";
pub const JSON_REPORT_SUFFIX: &str = "-report.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub environment: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_records: usize,
    pub batches: usize,
    pub updates_enabled: bool,
    pub by_outcome: BTreeMap<RecordOutcome, u64>,
    pub report_path: String,
    pub staff_report_path: String,
    pub parquet_manifest: String,
}

/// Result of validating configuration and mappings without touching records.
#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
    pub environment: String,
    pub table: String,
    /// `(logical key, live field name)` in declaration order.
    pub mapped_fields: Vec<(String, String)>,
    pub alert_fields: Vec<String>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: MappingRegistry,
    store: Arc<dyn RecordStore>,
    transport: Arc<dyn LookupTransport>,
    notifier: Arc<dyn Notifier>,
    artifacts: ArtifactStore,
    running: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = config.http_client_config();
        let registry = MappingRegistry::from_workspace_root(&config.workspace_root, config.environment.as_str())?;
        let store = AirtableClient::new(&http, config.airtable.clone())?;
        let transport = HttpLookupTransport::new(&http, config.lookup_url.clone())?;
        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(
                &http,
                url.clone(),
                format!("Record sync report ({})", config.environment),
            )?),
            None => Arc::new(LogNotifier),
        };
        Ok(Self::with_components(
            config,
            registry,
            Arc::new(store),
            Arc::new(transport),
            notifier,
        ))
    }

    pub fn with_components(
        config: SyncConfig,
        registry: MappingRegistry,
        store: Arc<dyn RecordStore>,
        transport: Arc<dyn LookupTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        Self {
            config,
            registry,
            store,
            transport,
            notifier,
            artifacts,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Bind mappings to the live schema. Any unresolved field aborts the run.
    async fn resolve_registry(&self) -> Result<(String, ResolvedRegistry)> {
        let schema = self.store.fetch_schema().await.context("fetching store schema")?;
        let table = schema
            .table(&self.config.airtable.table_id)
            .ok_or_else(|| anyhow!("table {} not found in store schema", self.config.airtable.table_id))?;
        let resolved = self
            .registry
            .clone()
            .resolve(table)
            .context("resolving field mappings against store schema")?;
        Ok((table.name.clone(), resolved))
    }

    pub async fn check(&self) -> Result<CheckSummary> {
        let (table, resolved) = self.resolve_registry().await?;
        Ok(CheckSummary {
            environment: self.config.environment.to_string(),
            table,
            mapped_fields: resolved
                .entries()
                .iter()
                .map(|e| (e.mapping.key.clone(), e.field_name.clone()))
                .collect(),
            alert_fields: resolved.alert_fields().into_iter().map(str::to_string).collect(),
        })
    }

    async fn load_records(&self) -> Result<Vec<StoredRecord>> {
        let mut records = self
            .store
            .list_records(self.config.airtable_view.as_deref())
            .await
            .context("listing store records")?;
        if self.config.shuffle_records {
            records.shuffle(&mut rand::thread_rng());
        }
        if let Some(limit) = self.config.record_limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Run one full pass. Concurrent callers wait for the active run to finish.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let _running = self.running.lock().await;
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, environment = %self.config.environment, "sync run starting");

        let (_, registry) = self.resolve_registry().await?;
        let registry = Arc::new(registry);
        let records = self.load_records().await?;
        info!(records = records.len(), batch_size = self.config.batch_size, "records loaded");

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            LookupAdapter::new(Arc::clone(&self.transport), self.config.retry),
            Arc::clone(&self.store),
            self.config.identifier_field.clone(),
            UpdateOptions {
                enable_updates: self.config.enable_updates,
                typecast: self.config.enable_typecast,
            },
        ));
        let shared = SharedReport::new();
        let stats = run_batches(
            reconciler,
            records,
            self.config.batch_size,
            self.config.batch_delay,
            &shared,
        )
        .await;
        let report = shared.snapshot();
        let finished_at = Utc::now();

        let stamp = artifact_stamp(started_at, run_id);
        let (report_path, staff_report_path, text) = self.persist_reports(&report, &stamp, finished_at).await?;
        let manifest = export_parquet_snapshot(
            &self.artifacts,
            &Path::new(SNAPSHOTS_DIR).join(format!("{}-{stamp}", self.config.environment)),
            &report,
            self.artifact_metadata(run_id),
        )
        .await?;

        self.notify(&report, &registry, &text).await;

        let summary = SyncRunSummary {
            run_id,
            environment: self.config.environment.to_string(),
            started_at,
            finished_at,
            total_records: stats.records,
            batches: stats.batches,
            updates_enabled: self.config.enable_updates,
            by_outcome: report.summary.by_outcome.clone(),
            report_path: report_path.display().to_string(),
            staff_report_path: staff_report_path.display().to_string(),
            parquet_manifest: manifest.display().to_string(),
        };
        info!(
            %run_id,
            total = summary.total_records,
            batches = summary.batches,
            outcomes = ?summary.by_outcome,
            "sync run complete"
        );
        Ok(summary)
    }

    fn artifact_metadata(&self, run_id: Uuid) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("environment".to_string(), self.config.environment.to_string()),
            ("run_id".to_string(), run_id.to_string()),
        ])
    }

    async fn persist_reports(
        &self,
        report: &Report,
        stamp: &str,
        now: DateTime<Utc>,
    ) -> Result<(PathBuf, PathBuf, String)> {
        let env = self.config.environment;
        let metadata = BTreeMap::from([("environment".to_string(), env.to_string())]);

        let json = serde_json::to_vec_pretty(&report.to_json()?).context("serializing json report")?;
        let saved_json = self
            .artifacts
            .save(
                Path::new(JSON_REPORTS_DIR).join(format!("{env}-{stamp}{JSON_REPORT_SUFFIX}")),
                &json,
                SaveOptions {
                    content_type: None,
                    metadata: metadata.clone(),
                },
            )
            .await
            .context("saving json report")?;

        let text = report.render_text(now);
        let saved_text = self
            .artifacts
            .save(
                Path::new(STAFF_REPORTS_DIR).join(format!("{env}-{stamp}-staff-report.txt")),
                text.as_bytes(),
                SaveOptions {
                    content_type: None,
                    metadata,
                },
            )
            .await
            .context("saving staff report")?;

        Ok((saved_json.absolute_path, saved_text.absolute_path, text))
    }

    /// Alert on watched-field changes first, then send the staff report. Never fails the run.
    async fn notify(&self, report: &Report, registry: &ResolvedRegistry, staff_text: &str) {
        let alert_fields = registry.alert_fields();
        if let Some(alert) = alert_text(report, |field| alert_fields.contains(field)) {
            if let Err(err) = self.notifier.send_preconfigured(&alert).await {
                warn!(error = %err, "alert notification failed");
            }
        }
        if let Err(err) = self.notifier.send_preconfigured(staff_text).await {
            warn!(error = %err, "staff report notification failed");
        }
    }

    /// Cron job running [`SyncPipeline::run_once`], when scheduling is enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                    Err(err) => error!(error = ?err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Alert body for changes on watched fields, if there are any.
pub fn alert_text(report: &Report, watched: impl Fn(&str) -> bool) -> Option<String> {
    let changes = report.changes_where(watched);
    if changes.is_empty() {
        return None;
    }
    let mut lines = vec![format!("FIELD CHANGE ALERT ({} changes)", changes.len())];
    for (identifier, change) in changes {
        lines.push(format!(
            "- {identifier} {}: {}, previously {}",
            change.field,
            report::display_value(&change.new_value),
            report::display_value(&change.old_value)
        ));
    }
    Some(lines.join("\n"))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env()?;
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once().await
}

/// Sortable per-run artifact stamp; the run id suffix keeps runs in the same millisecond apart.
fn artifact_stamp(started_at: DateTime<Utc>, run_id: Uuid) -> String {
    let short_id = run_id.simple().to_string();
    format!("{}-{}", started_at.format("%Y%m%dT%H%M%S%3fZ"), &short_id[..8])
}

/// Newest persisted JSON report under `artifacts_dir`.
pub async fn latest_report(artifacts_dir: &Path) -> Result<Option<serde_json::Value>> {
    let store = ArtifactStore::new(artifacts_dir);
    let Some(path) = store.latest(JSON_REPORTS_DIR, JSON_REPORT_SUFFIX).await? else {
        return Ok(None);
    };
    let text = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}
