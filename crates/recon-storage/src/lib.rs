//! Report artifact storage + retrying network access for the reconciliation job.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod airtable;
pub mod lookup;
pub mod notify;

pub use airtable::{AirtableClient, AirtableConfig, RecordStore, StoreError};
pub use lookup::{body_snippet, html_title, HttpLookupTransport, LookupTransport, RawResponse};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};

pub const CRATE_NAME: &str = "recon-storage";

#[derive(Debug, Clone)]
pub struct SavedArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

/// Sidecar written next to every artifact as `<name>.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub content_type: String,
    pub sha256: String,
    pub byte_size: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn content_type_for(path: &Path) -> &'static str {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => "application/json",
            Some("txt") => "text/plain",
            Some("parquet") => "application/vnd.apache.parquet",
            _ => "application/octet-stream",
        }
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".meta.json");
        path.with_file_name(name)
    }

    /// Write bytes through a temp file + rename so readers never observe a partial artifact.
    pub async fn save(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
        options: SaveOptions,
    ) -> anyhow::Result<SavedArtifact> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let content_hash = Self::sha256_hex(bytes);
        write_atomic(&parent, &absolute_path, bytes).await?;

        let meta = ArtifactMetadata {
            content_type: options
                .content_type
                .unwrap_or_else(|| Self::content_type_for(&relative_path).to_string()),
            sha256: content_hash.clone(),
            byte_size: bytes.len(),
            created_at: Utc::now(),
            metadata: options.metadata,
        };
        let meta_bytes = serde_json::to_vec_pretty(&meta).context("serializing artifact metadata")?;
        write_atomic(&parent, &Self::sidecar_path(&absolute_path), &meta_bytes).await?;

        debug!(path = %absolute_path.display(), bytes = bytes.len(), "artifact saved");
        Ok(SavedArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }

    pub async fn read_metadata(&self, relative_path: impl AsRef<Path>) -> anyhow::Result<ArtifactMetadata> {
        let path = Self::sidecar_path(&self.root.join(relative_path.as_ref()));
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Newest artifact in `dir` whose name ends with `suffix`. Names carry a sortable timestamp.
    pub async fn latest(&self, dir: &str, suffix: &str) -> anyhow::Result<Option<PathBuf>> {
        let dir_path = self.root.join(dir);
        if !fs::try_exists(&dir_path).await.unwrap_or(false) {
            return Ok(None);
        }
        let mut entries = fs::read_dir(&dir_path)
            .await
            .with_context(|| format!("reading {}", dir_path.display()))?;
        let mut newest: Option<(String, PathBuf)> = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(suffix) {
                continue;
            }
            let stamp = name.split_once('-').map(|(_, rest)| rest.to_string()).unwrap_or_default();
            if newest.as_ref().map(|(s, _)| stamp > *s).unwrap_or(true) {
                newest = Some((stamp, entry.path()));
            }
        }
        Ok(newest.map(|(_, p)| p))
    }
}

async fn write_atomic(parent: &Path, target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, target).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp artifact {} -> {}",
                temp_path.display(),
                target.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build().context("building reqwest client")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Transport failure of one external lookup attempt.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("empty response from server: {0}")]
    EmptyResponse(String),
    #[error("http status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl LookupError {
    /// Only the empty-response class is worth another attempt.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            LookupError::EmptyResponse(_) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            LookupError::EmptyResponse(_) => "EmptyResponseError",
            LookupError::HttpStatus { .. } => "HttpStatusError",
            LookupError::Request(_) => "RequestError",
            LookupError::Unexpected(_) => "UnexpectedResponseError",
        }
    }

    pub fn is_empty_response(&self) -> bool {
        matches!(self, LookupError::EmptyResponse(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry, e.g. `1.5` or `2.0`.
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(5_000),
            max_delay: Duration::from_millis(60_000),
            backoff_factor: 2.0,
        }
    }
}

/// One observation per lookup attempt, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSample {
    pub duration: Duration,
    pub success: bool,
    pub error_type: Option<String>,
    pub is_empty: bool,
    /// 1-based attempt index.
    pub attempt: u32,
    /// Delay slept after this attempt; zero when no retry followed.
    pub backoff_delay: Duration,
}

pub trait AttemptObserver: Send + Sync {
    fn observe(&self, sample: AttemptSample);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AttemptObserver for NoopObserver {
    fn observe(&self, _sample: AttemptSample) {}
}

fn next_delay(delay: Duration, policy: &RetryPolicy) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * policy.backoff_factor)
        .unwrap_or(policy.max_delay)
        .min(policy.max_delay)
}

/// Run `op` under `policy`, retrying only retryable failures with multiplicative backoff.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    observer: &dyn AttemptObserver,
    is_empty: impl Fn(&T) -> bool,
    mut op: F,
) -> Result<T, LookupError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LookupError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    let mut delay = policy.initial_delay.min(policy.max_delay);

    loop {
        let started = Instant::now();
        match op(attempt).await {
            Ok(value) => {
                observer.observe(AttemptSample {
                    duration: started.elapsed(),
                    success: true,
                    error_type: None,
                    is_empty: is_empty(&value),
                    attempt,
                    backoff_delay: Duration::ZERO,
                });
                return Ok(value);
            }
            Err(err) => {
                let retry = err.disposition() == RetryDisposition::Retryable && attempt < max_attempts;
                observer.observe(AttemptSample {
                    duration: started.elapsed(),
                    success: false,
                    error_type: Some(err.error_type().to_string()),
                    is_empty: err.is_empty_response(),
                    attempt,
                    backoff_delay: if retry { delay } else { Duration::ZERO },
                });
                if !retry {
                    return Err(err);
                }

                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, policy);
                attempt += 1;
            }
        }
    }
}
