//! Chat notifications for lock loss.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to send webhook message: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Something that can deliver a short text message to humans.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
}

/// Posts messages to a Slack incoming webhook.
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            webhook_url: webhook_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    #[instrument(skip(self), level = "debug")]
    async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&WebhookMessage { text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        debug!("Webhook message delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_posts_text_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/lock"))
            .and(body_json(json!({ "text": "lost lock nightly" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = SlackNotifier::new(format!("{}/hooks/lock", server.uri()));
        notifier.notify("lost lock nightly").await.unwrap();
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no_service"))
            .mount(&server)
            .await;

        let notifier = SlackNotifier::new(server.uri());
        let err = notifier.notify("hello").await.unwrap_err();
        match err {
            NotifyError::Status { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "no_service");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
