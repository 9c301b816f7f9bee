use agent_ports::{AlertSink, PortError, PortResult};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

/// Posts alerts to a Discord webhook. With no webhook configured, alerts
/// are only logged.
pub struct DiscordAlertSink {
    client: Client,
    webhook_url: String,
}

impl DiscordAlertSink {
    pub fn new(webhook_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            webhook_url,
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.webhook_url.is_empty()
    }
}

#[async_trait]
impl AlertSink for DiscordAlertSink {
    async fn notify(&self, message: &str) -> PortResult<()> {
        if !self.is_configured() {
            tracing::info!("Alert (Discord not configured): {}", message);
            return Ok(());
        }

        let payload = json!({
            "content": message,
            "username": "Agent Risk Control",
        });

        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| PortError::Unavailable(format!("discord webhook: {}", e)))?;

        tracing::debug!("Discord notification sent");
        Ok(())
    }
}
