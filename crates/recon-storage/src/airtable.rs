//! Tabular-store client (Airtable REST API).

use std::fmt;

use async_trait::async_trait;
use recon_core::{BaseSchema, StoredRecord};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::HttpClientConfig;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list_records(&self, view: Option<&str>) -> Result<Vec<StoredRecord>, StoreError>;

    /// Apply every field in `fields` to one record in a single write.
    async fn update_record(
        &self,
        record_id: &str,
        fields: Map<String, Value>,
        typecast: bool,
    ) -> Result<(), StoreError>;

    async fn fetch_schema(&self) -> Result<BaseSchema, StoreError>;
}

#[derive(Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub api_key: String,
    pub base_id: String,
    pub table_id: String,
}

impl fmt::Debug for AirtableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AirtableConfig")
            .field("api_url", &self.api_url)
            .field("api_key", &"<redacted>")
            .field("base_id", &self.base_id)
            .field("table_id", &self.table_id)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AirtableClient {
    client: reqwest::Client,
    config: AirtableConfig,
}

#[derive(Debug, Deserialize)]
struct ListPage {
    records: Vec<StoredRecord>,
    #[serde(default)]
    offset: Option<String>,
}

impl AirtableClient {
    pub fn new(http: &HttpClientConfig, config: AirtableConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            config,
        })
    }

    fn table_url(&self) -> String {
        format!(
            "{}/v0/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.base_id,
            self.config.table_id
        )
    }

    async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::HttpStatus {
            status: status.as_u16(),
            body: body.chars().take(500).collect(),
        })
    }
}

#[async_trait]
impl RecordStore for AirtableClient {
    async fn list_records(&self, view: Option<&str>) -> Result<Vec<StoredRecord>, StoreError> {
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(view) = view {
                query.push(("view", view.to_string()));
            }
            if let Some(offset) = &offset {
                query.push(("offset", offset.clone()));
            }

            let resp = self
                .client
                .get(self.table_url())
                .bearer_auth(&self.config.api_key)
                .query(&query)
                .send()
                .await?;
            let page: ListPage = Self::ensure_success(resp).await?.json().await?;
            debug!(page_records = page.records.len(), "fetched record page");
            records.extend(page.records);

            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        info!(records = records.len(), "listed store records");
        Ok(records)
    }

    async fn update_record(
        &self,
        record_id: &str,
        fields: Map<String, Value>,
        typecast: bool,
    ) -> Result<(), StoreError> {
        let resp = self
            .client
            .patch(format!("{}/{}", self.table_url(), record_id))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "fields": fields, "typecast": typecast }))
            .send()
            .await?;
        Self::ensure_success(resp).await?;
        Ok(())
    }

    async fn fetch_schema(&self) -> Result<BaseSchema, StoreError> {
        let url = format!(
            "{}/v0/meta/bases/{}/tables",
            self.config.api_url.trim_end_matches('/'),
            self.config.base_id
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;
        Ok(Self::ensure_success(resp).await?.json().await?)
    }
}
