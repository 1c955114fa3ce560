//! HTTP trigger for sync runs plus read-only report endpoints.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recon_core::RecordOutcome;
use recon_sync::{latest_report, SyncConfig, SyncPipeline, SyncRunSummary};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "recon-web";

/// Something that can perform one sync run on request.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn run(&self) -> anyhow::Result<SyncRunSummary>;
}

#[async_trait]
impl SyncRunner for SyncPipeline {
    async fn run(&self) -> anyhow::Result<SyncRunSummary> {
        self.run_once().await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub trigger_token: Option<String>,
    pub runner: Arc<dyn SyncRunner>,
    pub artifacts_dir: PathBuf,
}

impl AppState {
    pub fn new(trigger_token: Option<String>, runner: Arc<dyn SyncRunner>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            trigger_token,
            runner,
            artifacts_dir: artifacts_dir.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SyncQuery {
    #[serde(default)]
    wait: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ReportQuery {
    outcome: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/sync", post(sync_handler))
        .route("/reports/latest", get(latest_report_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(config: SyncConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let state = AppState::new(
        config.trigger_token.clone(),
        Arc::new(SyncPipeline::new(config.clone())?),
        config.artifacts_dir.clone(),
    );
    if state.trigger_token.is_none() {
        warn!("SYNC_TRIGGER_TOKEN is not set, POST /sync will refuse every request");
    }
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "web trigger listening");
    axum::serve(listener, app(state)).await.context("serving http")?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(SyncConfig::from_env()?).await
}

async fn healthz_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

async fn sync_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SyncQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(expected) = state.trigger_token.as_deref() else {
        error!("sync trigger rejected: no trigger token configured");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "trigger token not configured");
    };
    if bearer_token(&headers) != Some(expected) {
        warn!("sync trigger rejected: bad or missing bearer token");
        return error_response(StatusCode::FORBIDDEN, "forbidden");
    }

    if query.wait {
        return match state.runner.run().await {
            Ok(summary) => Json(summary).into_response(),
            Err(err) => {
                error!(error = ?err, "triggered sync failed");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err:#}"))
            }
        };
    }

    let runner = Arc::clone(&state.runner);
    tokio::spawn(async move {
        match runner.run().await {
            Ok(summary) => info!(run_id = %summary.run_id, "triggered sync finished"),
            Err(err) => error!(error = ?err, "triggered sync failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))).into_response()
}

async fn latest_report_handler(State(state): State<Arc<AppState>>, Query(query): Query<ReportQuery>) -> Response {
    let outcome = match query.outcome.as_deref().map(RecordOutcome::from_str).transpose() {
        Ok(outcome) => outcome,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let report = match latest_report(&state.artifacts_dir).await {
        Ok(Some(report)) => report,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "no report has been written yet"),
        Err(err) => {
            error!(error = ?err, "loading latest report failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &format!("{err:#}"));
        }
    };

    match outcome {
        None => Json(report).into_response(),
        Some(outcome) => Json(records_with_outcome(&report, outcome)).into_response(),
    }
}

fn records_with_outcome(report: &Value, outcome: RecordOutcome) -> Value {
    let records = report
        .get("records")
        .and_then(Value::as_object)
        .map(|records| {
            records
                .iter()
                .filter(|(_, entry)| entry.get("outcome").and_then(Value::as_str) == Some(outcome.as_str()))
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect::<serde_json::Map<_, _>>()
        })
        .unwrap_or_default();
    json!({
        "outcome": outcome,
        "count": records.len(),
        "records": records,
    })
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
