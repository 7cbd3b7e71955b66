//! 告警 Webhook - 将 critical 健康问题推送到 `cloud.webhookUrl`

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use crate::health::HealthIssue;

const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook 请求载荷
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload<'a> {
    pub device_id: &'a str,
    pub event: &'static str,
    pub issue: &'a HealthIssue,
}

/// 告警发送器
#[derive(Debug, Clone)]
pub struct WebhookAlerter {
    client: Client,
}

impl WebhookAlerter {
    pub fn new() -> Result<Self> {
        Self::with_timeout(ALERT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    /// 推送一条 critical 问题
    pub async fn send_critical(
        &self,
        url: &str,
        api_key: &str,
        device_id: &str,
        issue: &HealthIssue,
    ) -> Result<()> {
        let payload = AlertPayload {
            device_id,
            event: "criticalIssue",
            issue,
        };

        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .header("X-Device-ID", device_id)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("HTTP request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("webhook returned {}", status));
        }
        Ok(())
    }
}
