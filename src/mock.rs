use crate::clock::Clock;
use crate::credentials::{Credential, StaticCredentials};
use crate::error::UsageError;
use crate::models::{CostSummary, ProviderId};
use crate::providers::claude::{ClaudeUsage, ExtraUsageResponse, RateWindowResponse};
use crate::providers::codex::{CodexUsage, RateLimitDetails, WindowSnapshot};
use crate::providers::{ProviderFetcher, RawUsagePayload};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use std::sync::Arc;

/// Canned payloads for `--mock`, with reset times relative to the clock.
pub struct MockFetcher {
    provider: ProviderId,
    clock: Arc<dyn Clock>,
}

impl MockFetcher {
    pub fn new(provider: ProviderId, clock: Arc<dyn Clock>) -> Self {
        Self { provider, clock }
    }
}

pub fn mock_credentials() -> StaticCredentials {
    let mut claude = Credential::bearer(ProviderId::Claude, "mock-claude-token");
    claude.plan_hints = vec!["default_claude_max_20x".to_string(), "max".to_string()];

    let mut codex = Credential::bearer(ProviderId::Codex, "mock-codex-token");
    codex.account_id = Some("mock-account".to_string());

    StaticCredentials::new([claude, codex])
}

fn iso(at: DateTime<Utc>) -> Option<String> {
    Some(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn claude_payload(now: DateTime<Utc>) -> ClaudeUsage {
    // 72% of the week used with 4 days left
    ClaudeUsage {
        five_hour: Some(RateWindowResponse {
            utilization: Some(41.0),
            resets_at: iso(now + Duration::hours(3)),
        }),
        seven_day: Some(RateWindowResponse {
            utilization: Some(72.0),
            resets_at: iso(now + Duration::days(4)),
        }),
        seven_day_sonnet: Some(RateWindowResponse {
            utilization: Some(18.0),
            resets_at: iso(now + Duration::days(4)),
        }),
        seven_day_opus: Some(RateWindowResponse {
            utilization: Some(64.0),
            resets_at: iso(now + Duration::days(4)),
        }),
        extra_usage: Some(ExtraUsageResponse {
            is_enabled: true,
            monthly_limit: Some(5000.0),
            used_credits: Some(1250.0),
            utilization: None,
            currency: Some("USD".to_string()),
        }),
    }
}

fn codex_payload(now: DateTime<Utc>) -> CodexUsage {
    CodexUsage {
        plan_type: Some("pro".to_string()),
        rate_limit: Some(RateLimitDetails {
            primary_window: Some(WindowSnapshot {
                used: Some(410.0),
                limit: Some(1000.0),
                reset_at: Some((now + Duration::minutes(95)).timestamp()),
                limit_window_seconds: Some(5 * 60 * 60),
                ..Default::default()
            }),
            secondary_window: Some(WindowSnapshot {
                used_percent: Some(22.0),
                reset_at: Some((now + Duration::days(2)).timestamp()),
                limit_window_seconds: Some(7 * 24 * 60 * 60),
                ..Default::default()
            }),
        }),
    }
}

#[async_trait]
impl ProviderFetcher for MockFetcher {
    fn id(&self) -> ProviderId {
        self.provider
    }

    async fn fetch_usage(&self, _credential: &Credential) -> Result<RawUsagePayload, UsageError> {
        let now = self.clock.now();
        Ok(match self.provider {
            ProviderId::Claude => RawUsagePayload::Claude(claude_payload(now)),
            ProviderId::Codex => RawUsagePayload::Codex(codex_payload(now)),
        })
    }

    async fn local_costs(&self, _now: DateTime<Utc>) -> CostSummary {
        match self.provider {
            ProviderId::Claude => CostSummary {
                today: 2.15,
                today_tokens: 430_000,
                last_30_days: 61.8,
                last_30_days_tokens: 12_400_000,
            },
            ProviderId::Codex => CostSummary {
                today: 0.0,
                today_tokens: 182_000,
                last_30_days: 0.0,
                last_30_days_tokens: 3_050_000,
            },
        }
    }
}
