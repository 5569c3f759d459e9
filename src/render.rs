use crate::models::{AggregatedResult, PaceStatus, UsageSnapshot};
use crate::pace;
use chrono::{DateTime, Local, Utc};
use colored::{ColoredString, Colorize};
use std::fmt::Write;

const BAR_WIDTH: usize = 25;

/// Human-readable status for every provider, in result order.
pub fn render_status(result: &AggregatedResult, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    for (i, snapshot) in result.providers.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        render_provider(&mut out, snapshot, result.stale(snapshot.provider_id), now);
    }

    let updated = result
        .timestamp
        .with_timezone(&Local)
        .format("%H:%M")
        .to_string();
    let _ = writeln!(out, "\n{}", format!("Updated at {}", updated).dimmed());
    out
}

fn render_provider(
    out: &mut String,
    snapshot: &UsageSnapshot,
    stale: Option<&UsageSnapshot>,
    now: DateTime<Utc>,
) {
    if !snapshot.is_connected {
        let _ = writeln!(out, "{}", snapshot.provider_name.bold());
        let message = snapshot.error_message.as_deref().unwrap_or("Not connected");
        let _ = writeln!(out, "  {}", message.red());
        if let Some(stale) = stale {
            let _ = writeln!(
                out,
                "  {}",
                format!(
                    "Last seen {} ago: session {:.0}%, week {:.0}%",
                    pace::format_duration(seconds_between(stale.fetched_at, now)),
                    stale.session_used_pct,
                    stale.weekly_used_pct
                )
                .dimmed()
            );
        }
        return;
    }

    let _ = writeln!(
        out,
        "{}  {}",
        snapshot.provider_name.bold(),
        snapshot.plan_name.cyan()
    );

    quota_line(
        out,
        "Current session",
        snapshot.session_used_pct,
        snapshot.session_reset_time,
        now,
    );
    quota_line(
        out,
        "Current week",
        snapshot.weekly_used_pct,
        snapshot.weekly_reset_time,
        now,
    );

    let mut pace_text = pace_label(snapshot.pace_status, snapshot.pace_delta_pct).to_string();
    if let Some(eta) = pace::weekly_pace(
        snapshot.weekly_used_pct,
        snapshot.weekly_reset_time,
        snapshot.weekly_window(),
        now,
    )
    .and_then(|p| pace::format_pace_eta(&p))
    {
        let _ = write!(pace_text, "  {}", eta.dimmed());
    }
    let _ = writeln!(out, "  {:<16}{}", "Pace", pace_text);

    for (model, pct) in &snapshot.model_usage {
        quota_line(out, &format!("Week ({})", model), *pct, None, now);
    }

    if snapshot.extra_usage_enabled {
        let _ = writeln!(
            out,
            "  {:<16}{} {:>3.0}%  ${:.2} / ${:.2}",
            "Extra usage",
            usage_bar(snapshot.extra_usage_pct),
            snapshot.extra_usage_pct,
            snapshot.extra_usage_current,
            snapshot.extra_usage_limit
        );
    }

    if snapshot.cost_30_days_tokens > 0 || snapshot.cost_30_days > 0.0 {
        let _ = writeln!(
            out,
            "  {:<16}{}",
            "Cost",
            format!(
                "today {}  |  30 days {}",
                cost_text(snapshot.cost_today, snapshot.cost_today_tokens),
                cost_text(snapshot.cost_30_days, snapshot.cost_30_days_tokens)
            )
            .dimmed()
        );
    }
}

fn quota_line(
    out: &mut String,
    label: &str,
    used_pct: f64,
    reset: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    let _ = write!(
        out,
        "  {:<16}{} {:>3.0}%",
        label,
        usage_bar(used_pct),
        used_pct
    );
    if let Some(reset) = reset {
        let _ = write!(
            out,
            "  {}",
            format!("resets in {}", pace::format_duration(seconds_between(now, reset))).dimmed()
        );
    }
    out.push('\n');
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

fn bar_cells(used_pct: f64) -> usize {
    let fraction = used_pct.clamp(0.0, 100.0) / 100.0;
    ((fraction * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH)
}

pub fn usage_bar(used_pct: f64) -> ColoredString {
    let filled = bar_cells(used_pct);
    let bar = format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled));
    if used_pct < 50.0 {
        bar.green()
    } else if used_pct < 80.0 {
        bar.yellow()
    } else {
        bar.red()
    }
}

fn pace_label(status: PaceStatus, delta: f64) -> ColoredString {
    let text = pace::format_pace(status, delta);
    match status {
        PaceStatus::OnTrack => text.green(),
        PaceStatus::Ahead => text.red(),
        PaceStatus::Behind => text.blue(),
    }
}

fn cost_text(usd: f64, tokens: u64) -> String {
    if usd > 0.0 {
        format!("${:.2} ({} tokens)", usd, format_tokens(tokens))
    } else {
        format!("{} tokens", format_tokens(tokens))
    }
}

pub fn format_tokens(tokens: u64) -> String {
    let n = tokens as f64;
    if n >= 1e9 {
        format!("{:.1}B", n / 1e9)
    } else if n >= 1e6 {
        format!("{:.1}M", n / 1e6)
    } else if n >= 1e3 {
        format!("{:.1}K", n / 1e3)
    } else {
        tokens.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderId;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn test_format_tokens() {
        assert_eq!(format_tokens(950), "950");
        assert_eq!(format_tokens(1_500), "1.5K");
        assert_eq!(format_tokens(12_400_000), "12.4M");
        assert_eq!(format_tokens(2_000_000_000), "2.0B");
    }

    #[test]
    fn test_bar_cells_clamped() {
        assert_eq!(bar_cells(0.0), 0);
        assert_eq!(bar_cells(50.0), 13);
        assert_eq!(bar_cells(100.0), BAR_WIDTH);
        assert_eq!(bar_cells(250.0), BAR_WIDTH);
        assert_eq!(bar_cells(-4.0), 0);
    }

    #[test]
    fn test_usage_bar_width() {
        plain();
        assert_eq!(usage_bar(40.0).to_string().chars().count(), BAR_WIDTH);
    }

    #[test]
    fn test_render_connected_and_disconnected() {
        plain();
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();

        let mut claude = UsageSnapshot::empty(ProviderId::Claude, now);
        claude.plan_name = "Max".into();
        claude.session_used_pct = 41.0;
        claude.session_reset_time = Some(now + Duration::hours(2));
        claude.weekly_used_pct = 80.0;
        claude.weekly_reset_time = Some(now + Duration::days(4));
        claude.pace_status = PaceStatus::Ahead;
        claude.pace_delta_pct = 37.1;
        claude.model_usage.insert("Opus".into(), 64.0);
        claude.cost_today = 2.5;
        claude.cost_today_tokens = 500_000;
        claude.cost_30_days_tokens = 9_000_000;

        let codex = UsageSnapshot::disconnected(ProviderId::Codex, "Token expired", now);
        let result = AggregatedResult::new(vec![claude, codex], now);
        let text = render_status(&result, now);

        assert!(text.contains("Claude  Max"));
        assert!(text.contains("resets in 2h"));
        assert!(text.contains("Ahead (+37%)"));
        assert!(text.contains("Week (Opus)"));
        assert!(text.contains("today $2.50 (500.0K tokens)"));
        assert!(text.contains("30 days 9.0M tokens"));
        assert!(text.contains("Codex\n  Token expired"));
        assert!(!text.contains("Last seen"));
    }

    #[test]
    fn test_render_stale_fallback() {
        plain();
        let t0 = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();
        let t1 = t0 + Duration::minutes(5);

        let mut good = UsageSnapshot::empty(ProviderId::Codex, t0);
        good.weekly_used_pct = 33.0;

        let mut failed = AggregatedResult::new(
            vec![UsageSnapshot::disconnected(ProviderId::Codex, "API error: 502", t1)],
            t1,
        );
        let text = render_status(&failed, t1);
        assert!(!text.contains("Last seen"));

        failed.last_connected.insert(ProviderId::Codex, good);
        let text = render_status(&failed, t1);
        assert!(text.contains("API error: 502"));
        assert!(text.contains("Last seen 5m ago: session 0%, week 33%"));
    }

    #[test]
    fn test_pace_eta_uses_reported_window() {
        plain();
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();
        let mut codex = UsageSnapshot::empty(ProviderId::Codex, now);
        codex.weekly_used_pct = 75.0;
        codex.weekly_reset_time = Some(now + Duration::hours(12));
        codex.weekly_window_seconds = Some(86_400);
        codex.pace_status = PaceStatus::Ahead;
        codex.pace_delta_pct = 25.0;

        let text = render_status(&AggregatedResult::new(vec![codex.clone()], now), now);
        assert!(text.contains("Ahead (+25%)"));
        assert!(text.contains("Runs out in 4h"));

        codex.weekly_window_seconds = None;
        let text = render_status(&AggregatedResult::new(vec![codex], now), now);
        assert!(text.contains("Lasts until reset"));
    }
}
