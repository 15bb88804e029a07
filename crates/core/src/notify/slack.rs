//! Slack incoming-webhook sender for merge notifications.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::errors::NotificationError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SlackNotifier {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "falling back to default HTTP client for Slack");
                reqwest::Client::new()
            });
        Self { webhook_url, http }
    }

    /// Post `message` (Slack mrkdwn) to the webhook.
    pub async fn send_message(&self, message: &str) -> Result<(), NotificationError> {
        debug!(len = message.len(), "sending Slack message");

        let payload = serde_json::json!({
            "username": "mergeflow",
            "text": message,
            "unfurl_links": false,
            "unfurl_media": false,
        });

        let resp = self
            .http
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(NotificationError::HttpError)?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook returned error");
            return Err(NotificationError::SlackError(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        info!("Slack message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_webhook_is_http_error() {
        let notifier = SlackNotifier::new("http://127.0.0.1:9/hook".into());
        let err = notifier.send_message("hello").await.unwrap_err();
        assert!(matches!(err, NotificationError::HttpError(_)));
    }
}
