use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

/// Supported providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Claude,
    Codex,
}

impl ProviderId {
    pub const ALL: [ProviderId; 2] = [ProviderId::Claude, ProviderId::Codex];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Claude => "claude",
            ProviderId::Codex => "codex",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderId::Claude => "Claude",
            ProviderId::Codex => "Codex",
        }
    }

    /// CLI the user runs to (re)authenticate.
    pub fn login_command(&self) -> &'static str {
        match self {
            ProviderId::Claude => "claude",
            ProviderId::Codex => "codex",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weekly pace classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaceStatus {
    #[default]
    OnTrack,
    /// Burning quota faster than the window elapses
    Ahead,
    /// Burning quota slower than the window elapses
    Behind,
}

/// Normalized usage record for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub provider_id: ProviderId,
    pub provider_name: String,
    pub is_connected: bool,
    pub error_message: Option<String>,
    pub plan_name: String,

    /// 5-hour window, 0-100
    pub session_used_pct: f64,
    pub session_reset_time: Option<DateTime<Utc>>,

    /// 7-day window, 0-100
    pub weekly_used_pct: f64,
    pub weekly_reset_time: Option<DateTime<Utc>>,
    /// Length of the weekly window when the provider reports one
    #[serde(default)]
    pub weekly_window_seconds: Option<i64>,

    pub pace_status: PaceStatus,
    /// Actual minus expected weekly usage, in percentage points
    #[serde(default)]
    pub pace_delta_pct: f64,

    /// Per-model weekly quota in provider order
    pub model_usage: IndexMap<String, f64>,

    pub extra_usage_enabled: bool,
    pub extra_usage_pct: f64,
    pub extra_usage_current: f64,
    pub extra_usage_limit: f64,

    pub cost_today: f64,
    pub cost_today_tokens: u64,
    pub cost_30_days: f64,
    pub cost_30_days_tokens: u64,

    pub fetched_at: DateTime<Utc>,
}

impl UsageSnapshot {
    /// A connected snapshot with every metric at its default.
    pub fn empty(provider: ProviderId, fetched_at: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider,
            provider_name: provider.display_name().to_string(),
            is_connected: true,
            error_message: None,
            plan_name: "Unknown".to_string(),
            session_used_pct: 0.0,
            session_reset_time: None,
            weekly_used_pct: 0.0,
            weekly_reset_time: None,
            weekly_window_seconds: None,
            pace_status: PaceStatus::OnTrack,
            pace_delta_pct: 0.0,
            model_usage: IndexMap::new(),
            extra_usage_enabled: false,
            extra_usage_pct: 0.0,
            extra_usage_current: 0.0,
            extra_usage_limit: 0.0,
            cost_today: 0.0,
            cost_today_tokens: 0,
            cost_30_days: 0.0,
            cost_30_days_tokens: 0,
            fetched_at,
        }
    }

    /// A snapshot for a provider whose pipeline failed. Carries no metrics.
    pub fn disconnected(
        provider: ProviderId,
        message: impl Into<String>,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "Not connected".to_string();
        }
        Self {
            is_connected: false,
            error_message: Some(message),
            ..Self::empty(provider, fetched_at)
        }
    }

    /// Reported weekly window, if it is positive and representable.
    pub fn weekly_window(&self) -> Option<chrono::Duration> {
        self.weekly_window_seconds
            .filter(|s| *s > 0)
            .and_then(chrono::Duration::try_seconds)
    }

    pub fn apply_costs(&mut self, costs: &CostSummary) {
        self.cost_today = costs.today.max(0.0);
        self.cost_today_tokens = costs.today_tokens;
        self.cost_30_days = costs.last_30_days.max(0.0);
        self.cost_30_days_tokens = costs.last_30_days_tokens;
    }
}

/// Locally derived spend/token totals
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostSummary {
    pub today: f64,
    pub today_tokens: u64,
    pub last_30_days: f64,
    pub last_30_days_tokens: u64,
}

/// One snapshot per configured provider, in configuration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub providers: Vec<UsageSnapshot>,
    pub timestamp: DateTime<Utc>,
    /// Last connected snapshot of each provider that is currently
    /// disconnected, for "stale since" display
    #[serde(default)]
    pub last_connected: IndexMap<ProviderId, UsageSnapshot>,
}

impl AggregatedResult {
    pub fn new(providers: Vec<UsageSnapshot>, timestamp: DateTime<Utc>) -> Self {
        Self {
            providers,
            timestamp,
            last_connected: IndexMap::new(),
        }
    }

    pub fn stale(&self, provider: ProviderId) -> Option<&UsageSnapshot> {
        self.last_connected.get(&provider)
    }

    pub fn connected_count(&self) -> usize {
        self.providers.iter().filter(|s| s.is_connected).count()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize usage snapshot")
    }

    /// Atomically replace `path` with this result as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .with_context(|| format!("Invalid snapshot path {}", path.display()))?;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(self.to_json()?.as_bytes())?;
        temp.persist(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn default_path() -> std::path::PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("usagebar")
            .join("snapshot.json")
    }
}
