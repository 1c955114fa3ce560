//! HTTP transport for the external identifier lookup service.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use scraper::{Html, Selector};
use tracing::debug;

use crate::{HttpClientConfig, LookupError};

/// Body and headers of a non-empty lookup response, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Trimmed text of the page's `<title>`, if it has a non-blank one.
pub fn html_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|node| node.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn body_snippet(text: &str) -> String {
    text.trim().chars().take(200).collect()
}

#[async_trait]
pub trait LookupTransport: Send + Sync {
    /// A blank body must surface as [`LookupError::EmptyResponse`].
    async fn lookup(&self, identifier: &str) -> Result<RawResponse, LookupError>;
}

#[derive(Debug, Clone)]
pub struct HttpLookupTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpLookupTransport {
    pub fn new(config: &HttpClientConfig, url: impl Into<String>) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl LookupTransport for HttpLookupTransport {
    async fn lookup(&self, identifier: &str) -> Result<RawResponse, LookupError> {
        let body = serde_json::to_string(identifier)
            .map_err(|e| LookupError::Unexpected(format!("encoding identifier: {e}")))?;

        let resp = self
            .client
            .post(&self.url)
            .header(ACCEPT, "*/*")
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .header("Sec-Fetch-Dest", "empty")
            .header("Sec-Fetch-Mode", "cors")
            .header("Sec-Fetch-Site", "same-origin")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let bytes = resp.bytes().await?.to_vec();
        debug!(identifier, status = status.as_u16(), bytes = bytes.len(), "lookup response");

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(LookupError::EmptyResponse(format!(
                "status {} with no body",
                status.as_u16()
            )));
        }

        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(LookupError::HttpStatus {
                status: status.as_u16(),
                message: html_title(&text).unwrap_or_else(|| body_snippet(&text)),
            });
        }

        Ok(RawResponse {
            status: status.as_u16(),
            content_type,
            body: bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn transport_for(server: &MockServer) -> HttpLookupTransport {
        HttpLookupTransport::new(
            &HttpClientConfig::default(),
            format!("{}/IncarceratedPerson/SearchByDin", server.uri()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn posts_quoted_identifier_and_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/IncarceratedPerson/SearchByDin"))
            .and(header("content-type", "application/json; charset=utf-8"))
            .and(body_string("\"07A4571\""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"county":"KINGS"}"#, "application/json"),
            )
            .mount(&server)
            .await;

        let resp = transport_for(&server).await.lookup("07A4571").await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.text(), r#"{"county":"KINGS"}"#);
        assert_eq!(resp.content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn blank_body_is_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("  \n"))
            .mount(&server)
            .await;

        let err = transport_for(&server).await.lookup("07A4571").await.unwrap_err();
        assert!(err.is_empty_response());
    }

    #[tokio::test]
    async fn error_status_with_body_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_raw(
                "<html><head><title> Access Denied </title></head><body><h1>Blocked</h1>request id 8c1f</body></html>",
                "text/html",
            ))
            .mount(&server)
            .await;

        let err = transport_for(&server).await.lookup("07A4571").await.unwrap_err();
        match &err {
            LookupError::HttpStatus { status, message } => {
                assert_eq!(*status, 403);
                assert_eq!(message, "Access Denied");
            }
            other => panic!("expected http status error, got {other:?}"),
        }
        assert!(err.to_string().contains("Access Denied"));
        assert_eq!(err.disposition(), crate::RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn error_status_without_title_keeps_body_snippet() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("  upstream timed out\n"))
            .mount(&server)
            .await;

        let err = transport_for(&server).await.lookup("07A4571").await.unwrap_err();
        assert!(matches!(
            err,
            LookupError::HttpStatus { status: 502, ref message } if message == "upstream timed out"
        ));
    }

    #[test]
    fn title_extraction_ignores_blank_titles() {
        assert_eq!(html_title("<title>Service Unavailable</title>").as_deref(), Some("Service Unavailable"));
        assert_eq!(html_title("<html><title>  </title></html>"), None);
        assert_eq!(html_title("no markup at all"), None);
    }
}
