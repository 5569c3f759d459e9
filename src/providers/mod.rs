pub mod claude;
pub mod codex;

use crate::credentials::Credential;
use crate::error::UsageError;
use crate::models::{CostSummary, ProviderId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub use claude::{ClaudeProvider, ClaudeUsage};
pub use codex::{CodexProvider, CodexUsage};

pub const USER_AGENT: &str = concat!("usagebar/", env!("CARGO_PKG_VERSION"));

/// Provider-specific usage payload, opaque outside its provider and normalizer.
#[derive(Debug, Clone, PartialEq)]
pub enum RawUsagePayload {
    Claude(ClaudeUsage),
    Codex(CodexUsage),
}

impl RawUsagePayload {
    pub fn provider(&self) -> ProviderId {
        match self {
            RawUsagePayload::Claude(_) => ProviderId::Claude,
            RawUsagePayload::Codex(_) => ProviderId::Codex,
        }
    }
}

#[async_trait]
pub trait ProviderFetcher: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Call the provider's usage endpoint.
    async fn fetch_usage(&self, credential: &Credential) -> Result<RawUsagePayload, UsageError>;

    /// Spend and token totals from the provider CLI's local logs.
    async fn local_costs(&self, _now: DateTime<Utc>) -> CostSummary {
        CostSummary::default()
    }
}

pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// Map status codes and decode the body of a usage response.
pub(crate) async fn read_usage_response<T: DeserializeOwned>(
    provider: ProviderId,
    response: reqwest::Response,
) -> Result<T, UsageError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(UsageError::Unauthenticated(format!(
            "{} token rejected ({}). Run `{}` to log in again.",
            provider.display_name(),
            status.as_u16(),
            provider.login_command()
        )));
    }
    if !status.is_success() {
        return Err(UsageError::ProviderUnavailable(format!(
            "API error: {}",
            status.as_u16()
        )));
    }

    let body = response
        .text()
        .await
        .map_err(|e| UsageError::from_transport("Failed to read usage response", e))?;
    serde_json::from_str(&body).map_err(|e| {
        UsageError::ParseError(format!(
            "Unexpected {} usage response: {}",
            provider.display_name(),
            e
        ))
    })
}
