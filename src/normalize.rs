//! Pure mapping from provider payloads to [`UsageSnapshot`].
//!
//! No I/O happens here. Absent fields fall back to 0, `false`, an empty
//! model map or `None` rather than failing the whole snapshot.

use crate::credentials::{parse_jwt_payload, Credential};
use crate::models::{ProviderId, UsageSnapshot};
use crate::pace;
use crate::providers::claude::{ClaudeUsage, ExtraUsageResponse, RateWindowResponse};
use crate::providers::codex::{CodexUsage, WindowSnapshot};
use crate::providers::RawUsagePayload;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

pub fn normalize(
    raw: &RawUsagePayload,
    credential: &Credential,
    now: DateTime<Utc>,
) -> UsageSnapshot {
    match raw {
        RawUsagePayload::Claude(usage) => normalize_claude(usage, credential, now),
        RawUsagePayload::Codex(usage) => normalize_codex(usage, credential, now),
    }
}

/// Clamp to [0, 100]; non-finite values become 0.
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Token-bucket style percentage, 0 when the limit is unknown.
pub fn ratio_percent(used: f64, limit: f64) -> f64 {
    if limit > 0.0 && used.is_finite() {
        clamp_percent(used / limit * 100.0)
    } else {
        0.0
    }
}

fn non_negative(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

pub fn normalize_claude(
    usage: &ClaudeUsage,
    credential: &Credential,
    now: DateTime<Utc>,
) -> UsageSnapshot {
    let mut snapshot = UsageSnapshot::empty(ProviderId::Claude, now);
    snapshot.plan_name = claude_plan_name(&credential.plan_hints);

    if let Some(window) = &usage.five_hour {
        snapshot.session_used_pct = claude_percent(window);
        snapshot.session_reset_time = window.resets_at.as_deref().and_then(parse_iso8601);
    }
    if let Some(window) = &usage.seven_day {
        snapshot.weekly_used_pct = claude_percent(window);
        snapshot.weekly_reset_time = window.resets_at.as_deref().and_then(parse_iso8601);
    }

    let models = [
        ("Sonnet", &usage.seven_day_sonnet),
        ("Opus", &usage.seven_day_opus),
    ];
    for (name, window) in models {
        if let Some(utilization) = window.as_ref().and_then(|w| w.utilization) {
            snapshot
                .model_usage
                .insert(name.to_string(), clamp_percent(utilization));
        }
    }

    if let Some(extra) = usage.extra_usage.as_ref().filter(|e| e.is_enabled) {
        apply_extra_usage(&mut snapshot, extra);
    }

    let (status, delta) =
        pace::evaluate_weekly(snapshot.weekly_used_pct, snapshot.weekly_reset_time, None, now);
    snapshot.pace_status = status;
    snapshot.pace_delta_pct = delta;
    snapshot
}

fn claude_percent(window: &RateWindowResponse) -> f64 {
    clamp_percent(window.utilization.unwrap_or(0.0))
}

fn apply_extra_usage(snapshot: &mut UsageSnapshot, extra: &ExtraUsageResponse) {
    let current = non_negative(extra.used_credits.unwrap_or(0.0) / 100.0);
    let limit = non_negative(extra.monthly_limit.unwrap_or(0.0) / 100.0);

    snapshot.extra_usage_enabled = true;
    snapshot.extra_usage_current = current;
    snapshot.extra_usage_limit = limit;
    snapshot.extra_usage_pct = match extra.utilization {
        Some(utilization) => clamp_percent(utilization),
        None => ratio_percent(current, limit),
    };
}

pub fn normalize_codex(
    usage: &CodexUsage,
    credential: &Credential,
    now: DateTime<Utc>,
) -> UsageSnapshot {
    let mut snapshot = UsageSnapshot::empty(ProviderId::Codex, now);
    snapshot.plan_name = codex_plan_name(usage.plan_type.as_deref(), credential.id_token.as_deref());

    let limits = usage.rate_limit.as_ref();
    if let Some(window) = limits.and_then(|l| l.primary_window.as_ref()) {
        snapshot.session_used_pct = codex_percent(window);
        snapshot.session_reset_time = codex_reset(window);
    }

    if let Some(window) = limits.and_then(|l| l.secondary_window.as_ref()) {
        snapshot.weekly_used_pct = codex_percent(window);
        snapshot.weekly_reset_time = codex_reset(window);
        snapshot.weekly_window_seconds = window
            .limit_window_seconds
            .filter(|s| *s > 0 && Duration::try_seconds(*s).is_some());
    }

    let (status, delta) = pace::evaluate_weekly(
        snapshot.weekly_used_pct,
        snapshot.weekly_reset_time,
        snapshot.weekly_window(),
        now,
    );
    snapshot.pace_status = status;
    snapshot.pace_delta_pct = delta;
    snapshot
}

fn codex_percent(window: &WindowSnapshot) -> f64 {
    match (window.used_percent, window.used, window.limit) {
        (Some(percent), _, _) => clamp_percent(percent),
        (None, Some(used), Some(limit)) => ratio_percent(used, limit),
        _ => 0.0,
    }
}

fn codex_reset(window: &WindowSnapshot) -> Option<DateTime<Utc>> {
    window
        .reset_at
        .filter(|ts| *ts > 0)
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

/// RFC 3339, or a bare `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
pub fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

/// Plan label from Claude's `rateLimitTier` / `subscriptionType` strings.
pub fn claude_plan_name(hints: &[String]) -> String {
    for hint in hints {
        let lower = hint.to_lowercase();
        let label = if lower.contains("enterprise") {
            "Enterprise"
        } else if lower.contains("team") {
            "Team"
        } else if lower.contains("max") {
            "Max"
        } else if lower.contains("pro") {
            "Pro"
        } else if lower.contains("free") {
            "Free"
        } else {
            continue;
        };
        return label.to_string();
    }

    hints
        .last()
        .map(|h| title_case(h))
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Plan label from the usage payload, falling back to the id-token claims.
pub fn codex_plan_name(plan_type: Option<&str>, id_token: Option<&str>) -> String {
    if let Some(plan) = plan_type.and_then(normalize_plan_name) {
        return plan;
    }

    let payload = id_token.and_then(parse_jwt_payload);
    payload
        .as_ref()
        .and_then(|p| p.get("https://api.openai.com/auth"))
        .and_then(Value::as_object)
        .and_then(|obj| obj.get("chatgpt_plan_type"))
        .and_then(Value::as_str)
        .and_then(normalize_plan_name)
        .or_else(|| {
            payload
                .as_ref()
                .and_then(|p| p.get("chatgpt_plan_type"))
                .and_then(Value::as_str)
                .and_then(normalize_plan_name)
        })
        .unwrap_or_else(|| "Unknown".to_string())
}

fn normalize_plan_name(plan: &str) -> Option<String> {
    let trimmed = plan.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lower = trimmed.to_lowercase();
    let label = match lower.as_str() {
        "free" => "Free",
        "plus" => "Plus",
        "pro" => "Pro",
        "team" => "Team",
        "enterprise" => "Enterprise",
        "business" => "Business",
        "education" => "Education",
        "go" => "Go",
        "guest" => "Guest",
        "free_workspace" => "Free Workspace",
        "k12" => "K-12",
        "quorum" => "Quorum",
        "edu" => "Edu",
        _ => return Some(title_case(trimmed)),
    };
    Some(label.to_string())
}

fn title_case(value: &str) -> String {
    value
        .split(['_', ' ', '-'])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
