//! The concrete webhook transport. The engine
//! only ever calls through `scheduler_core::notify::WebhookSink`; this is
//! the one real implementation the runnable binary ships.

use async_trait::async_trait;
use reqwest::Client;
use scheduler_core::notify::{NotificationPayload, WebhookSink};

/// Posts `{payload_template_id, variables}` as JSON to a configured URL.
/// Delivery failures are mapped to a `String` and logged by the caller —
/// never propagated to the run.
pub struct HttpWebhookSink {
    client: Client,
    url: String,
    token: Option<String>,
}

impl HttpWebhookSink {
    pub fn new(url: String, token: Option<String>) -> Self {
        Self { client: Client::new(), url, token }
    }
}

#[async_trait]
impl WebhookSink for HttpWebhookSink {
    async fn deliver(&self, payload: NotificationPayload) -> Result<(), String> {
        let mut request = self.client.post(&self.url).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook delivery returned status {}", response.status()))
        }
    }
}
