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

const DEFAULT_CHATGPT_BASE_URL: &str = "https://chatgpt.com/backend-api";
const CHATGPT_USAGE_PATH: &str = "/wham/usage";
const CODEX_USAGE_PATH: &str = "/api/codex/usage";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CodexUsage {
    #[serde(default)]
    pub plan_type: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitDetails>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RateLimitDetails {
    #[serde(default)]
    pub primary_window: Option<WindowSnapshot>,
    #[serde(default)]
    pub secondary_window: Option<WindowSnapshot>,
}

/// One rate window. Either `used_percent` or the token-bucket pair
/// `used`/`limit` is reported.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct WindowSnapshot {
    #[serde(default)]
    pub used_percent: Option<f64>,
    #[serde(default)]
    pub used: Option<f64>,
    #[serde(default)]
    pub limit: Option<f64>,
    /// Unix seconds
    #[serde(default)]
    pub reset_at: Option<i64>,
    #[serde(default)]
    pub limit_window_seconds: Option<i64>,
}

pub struct CodexProvider {
    client: reqwest::Client,
    usage_url: Option<String>,
    config_path: PathBuf,
    data_dir: PathBuf,
}

impl CodexProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: build_client(timeout),
            usage_url: None,
            config_path: credentials::codex::config_path(),
            data_dir: credentials::codex::data_dir(),
        }
    }

    #[cfg(test)]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    #[cfg(test)]
    pub fn with_usage_url(mut self, url: impl Into<String>) -> Self {
        self.usage_url = Some(url.into());
        self
    }

    /// Re-read on every fetch so edits to the Codex config apply without a
    /// restart.
    async fn resolve_usage_url(&self) -> String {
        if let Some(url) = &self.usage_url {
            return url.clone();
        }
        let base = tokio::fs::read_to_string(&self.config_path)
            .await
            .ok()
            .and_then(|contents| parse_chatgpt_base_url(&contents))
            .unwrap_or_else(|| DEFAULT_CHATGPT_BASE_URL.to_string());
        usage_url_for_base(&base)
    }
}

#[async_trait]
impl ProviderFetcher for CodexProvider {
    fn id(&self) -> ProviderId {
        ProviderId::Codex
    }

    async fn fetch_usage(&self, credential: &Credential) -> Result<RawUsagePayload, UsageError> {
        let url = self.resolve_usage_url().await;
        tracing::debug!(provider = "codex", url = %url, "Fetching usage");

        let mut request = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", credential.access_token))
            .header("Accept", "application/json");

        if let Some(account_id) = credential
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            request = request.header("ChatGPT-Account-Id", account_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UsageError::from_transport("Failed to connect to Codex usage API", e))?;

        let usage: CodexUsage = read_usage_response(ProviderId::Codex, response).await?;
        Ok(RawUsagePayload::Codex(usage))
    }

    async fn local_costs(&self, now: DateTime<Utc>) -> CostSummary {
        let data_dir = self.data_dir.clone();
        let today = now.with_timezone(&Local).date_naive();
        tokio::task::spawn_blocking(move || cost::codex_costs(&data_dir, today))
            .await
            .unwrap_or_default()
    }
}

fn parse_chatgpt_base_url(contents: &str) -> Option<String> {
    let value: toml::Value = toml::from_str(contents).ok()?;
    value
        .get("chatgpt_base_url")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn normalize_chatgpt_base_url(value: &str) -> String {
    let mut trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        trimmed = DEFAULT_CHATGPT_BASE_URL.to_string();
    }
    while trimmed.ends_with('/') {
        trimmed.pop();
    }
    if (trimmed.starts_with("https://chatgpt.com")
        || trimmed.starts_with("https://chat.openai.com"))
        && !trimmed.contains("/backend-api")
    {
        trimmed.push_str("/backend-api");
    }
    trimmed
}

fn usage_url_for_base(base: &str) -> String {
    let normalized = normalize_chatgpt_base_url(base);
    let path = if normalized.contains("/backend-api") {
        CHATGPT_USAGE_PATH
    } else {
        CODEX_USAGE_PATH
    };
    format!("{}{}", normalized, path)
}
