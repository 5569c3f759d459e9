use crate::cost;
use crate::credentials::{self, Credential};
use crate::error::UsageError;
use crate::models::{CostSummary, ProviderId};
use crate::providers::{build_client, read_usage_response, ProviderFetcher, RawUsagePayload};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const API_URL: &str = "https://api.anthropic.com/api/oauth/usage";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// API response from /api/oauth/usage
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ClaudeUsage {
    #[serde(default)]
    pub five_hour: Option<RateWindowResponse>,
    #[serde(default)]
    pub seven_day: Option<RateWindowResponse>,
    #[serde(default)]
    pub seven_day_sonnet: Option<RateWindowResponse>,
    #[serde(default)]
    pub seven_day_opus: Option<RateWindowResponse>,
    #[serde(default)]
    pub extra_usage: Option<ExtraUsageResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RateWindowResponse {
    /// Already a percentage (30.0 = 30%)
    #[serde(default)]
    pub utilization: Option<f64>,
    #[serde(default)]
    pub resets_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExtraUsageResponse {
    #[serde(default)]
    pub is_enabled: bool,
    /// Cents
    #[serde(default)]
    pub monthly_limit: Option<f64>,
    /// Cents
    #[serde(default)]
    pub used_credits: Option<f64>,
    #[serde(default)]
    pub utilization: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
}

pub struct ClaudeProvider {
    client: reqwest::Client,
    endpoint: String,
    data_dir: PathBuf,
}

impl ClaudeProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            endpoint: API_URL.to_string(),
            data_dir: credentials::claude::data_dir(),
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl ProviderFetcher for ClaudeProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Claude
    }

    async fn fetch_usage(&self, credential: &Credential) -> Result<RawUsagePayload, UsageError> {
        let response = self
            .client
            .get(&self.endpoint)
            .header("Authorization", format!("Bearer {}", credential.access_token))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("anthropic-beta", OAUTH_BETA)
            .send()
            .await
            .map_err(|e| UsageError::from_transport("Failed to connect to Anthropic API", e))?;

        let usage: ClaudeUsage = read_usage_response(ProviderId::Claude, response).await?;
        Ok(RawUsagePayload::Claude(usage))
    }

    async fn local_costs(&self, now: DateTime<Utc>) -> CostSummary {
        let data_dir = self.data_dir.clone();
        let today = now.with_timezone(&Local).date_naive();
        tokio::task::spawn_blocking(move || cost::claude_costs(&data_dir, today))
            .await
            .unwrap_or_default()
    }
}
