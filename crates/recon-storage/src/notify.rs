//! Staff notification delivery.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use crate::HttpClientConfig;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `text` to the preconfigured recipients.
    async fn send_preconfigured(&self, text: &str) -> anyhow::Result<()>;
}

/// Writes notifications to the log only; used when no delivery target is configured.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_preconfigured(&self, text: &str) -> anyhow::Result<()> {
        info!(chars = text.len(), "notification (log only)\n{text}");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    subject: String,
}

impl WebhookNotifier {
    pub fn new(
        http: &HttpClientConfig,
        url: impl Into<String>,
        subject: impl Into<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: http.build_client()?,
            url: url.into(),
            subject: subject.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_preconfigured(&self, text: &str) -> anyhow::Result<()> {
        self.client
            .post(&self.url)
            .json(&json!({ "subject": self.subject, "text": text }))
            .send()
            .await
            .context("posting notification webhook")?
            .error_for_status()
            .context("notification webhook rejected message")?;
        info!(url = %self.url, "notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_posts_subject_and_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(json!({"subject": "Sync report", "text": "hello"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            &HttpClientConfig::default(),
            format!("{}/hook", server.uri()),
            "Sync report",
        )
        .unwrap();
        notifier.send_preconfigured("hello").await.unwrap();
    }

    #[tokio::test]
    async fn webhook_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(&HttpClientConfig::default(), server.uri(), "Sync report").unwrap();
        assert!(notifier.send_preconfigured("hello").await.is_err());
    }
}
