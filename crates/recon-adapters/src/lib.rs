//! Source-side adapters: value normalizers, the field mapping registry, and
//! the lookup adapter that turns raw lookup responses into payload objects.

use std::sync::Arc;

use recon_core::{validate_identifier, RecordOutcome};
use recon_storage::{
    body_snippet as snippet, execute_with_retry, html_title, AttemptObserver, LookupError, LookupTransport,
    RawResponse, RetryPolicy,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod mapping;
pub mod normalize;

pub use mapping::{
    validate_type, FieldMapping, MappingError, MappingRegistry, MappingRule, ResolvedMapping,
    ResolvedRegistry, SourceKeys, SourceValue, DEFAULT_MAPPINGS_FILE,
};

pub const CRATE_NAME: &str = "recon-adapters";

/// Decoded lookup result: the person object returned by the lookup service.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidIdentifier,
    EmptyResponse,
    ResponseError,
}

impl FailureKind {
    pub fn name(&self) -> &'static str {
        match self {
            FailureKind::InvalidIdentifier => "InvalidIdentifierError",
            FailureKind::EmptyResponse => "EmptyResponseError",
            FailureKind::ResponseError => "ResponseError",
        }
    }

    pub fn outcome(&self) -> RecordOutcome {
        match self {
            FailureKind::InvalidIdentifier => RecordOutcome::InvalidIdentifier,
            FailureKind::EmptyResponse => RecordOutcome::EmptyResponse,
            FailureKind::ResponseError => RecordOutcome::ErrorResponse,
        }
    }
}

/// Structured lookup failure handed back to the caller instead of being raised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: {message}", .kind.name())]
pub struct LookupFailure {
    pub kind: FailureKind,
    /// Safe to show to staff in reports.
    pub message: String,
}

#[derive(Clone)]
pub struct LookupAdapter {
    transport: Arc<dyn LookupTransport>,
    policy: RetryPolicy,
}

impl LookupAdapter {
    pub fn new(transport: Arc<dyn LookupTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Validate, look up and decode one identifier. Every attempt reaches `observer`.
    pub async fn fetch_external(
        &self,
        identifier: &str,
        observer: &dyn AttemptObserver,
    ) -> Result<Payload, LookupFailure> {
        if !validate_identifier(identifier) {
            return Err(LookupFailure {
                kind: FailureKind::InvalidIdentifier,
                message: format!("invalid identifier {identifier:?}"),
            });
        }

        let span = info_span!("lookup", identifier);
        let transport = Arc::clone(&self.transport);
        let result = execute_with_retry(&self.policy, observer, |p: &Payload| p.is_empty(), |attempt| {
            let transport = Arc::clone(&transport);
            async move {
                debug!(attempt, "requesting lookup");
                let raw = transport.lookup(identifier).await?;
                decode_payload(&raw)
            }
        })
        .instrument(span)
        .await;

        result.map_err(|err| {
            let kind = if err.is_empty_response() {
                FailureKind::EmptyResponse
            } else {
                FailureKind::ResponseError
            };
            let message = match &err {
                LookupError::EmptyResponse(_) => format!(
                    "no response from lookup service after {} attempts ({err})",
                    self.policy.max_attempts.max(1)
                ),
                _ => err.to_string(),
            };
            warn!(identifier, error_type = err.error_type(), %message, "lookup failed");
            LookupFailure { kind, message }
        })
    }
}

/// Turn a non-empty response body into a payload object.
///
/// HTML pages (usually an upstream error or block page) are reported by their
/// `<title>`; any other non-object body is an unexpected response.
pub fn decode_payload(raw: &RawResponse) -> Result<Payload, LookupError> {
    let text = raw.text();
    let looks_like_html = raw
        .content_type
        .as_deref()
        .map(|ct| ct.contains("html"))
        .unwrap_or(false)
        || text.trim_start().starts_with('<');

    if looks_like_html {
        let title = html_title(&text).unwrap_or_else(|| snippet(&text));
        return Err(LookupError::Unexpected(format!("html page returned: {title}")));
    }

    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(payload)) => Ok(payload),
        Ok(other) => Err(LookupError::Unexpected(format!(
            "expected a JSON object, got {}",
            snippet(&other.to_string())
        ))),
        Err(_) => Err(LookupError::Unexpected(snippet(&text))),
    }
}
