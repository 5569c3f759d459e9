use crate::models::PaceStatus;
use chrono::{DateTime, Duration, Utc};

pub const WEEKLY_WINDOW_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Half-width of the "On track" band, in percentage points.
pub const PACE_TOLERANCE: f64 = 5.0;

#[derive(Debug, Clone, PartialEq)]
pub struct UsagePace {
    pub status: PaceStatus,
    pub delta_percent: f64,
    pub eta_seconds: Option<f64>,
    pub will_last_to_reset: bool,
}

impl UsagePace {
    /// Pace for a rolling window that ends at `resets_at`.
    ///
    /// Returns `None` when the reset is already past or lies further out than
    /// the window itself.
    pub fn for_window(
        used_percent: f64,
        resets_at: DateTime<Utc>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        let duration = window.num_milliseconds() as f64 / 1000.0;
        if duration <= 0.0 {
            return None;
        }

        let time_until_reset = (resets_at - now).num_milliseconds() as f64 / 1000.0;
        if time_until_reset <= 0.0 || time_until_reset > duration {
            return None;
        }

        let elapsed = (duration - time_until_reset).clamp(0.0, duration);
        let fraction = elapsed / duration;
        let actual = used_percent.clamp(0.0, 100.0);
        let expected = (fraction * 100.0).clamp(0.0, 100.0);

        let mut eta_seconds = None;
        let mut will_last_to_reset = false;

        if elapsed > 0.0 && actual > 0.0 {
            let rate = actual / elapsed;
            let remaining = (100.0 - actual).max(0.0);
            let candidate = remaining / rate;
            if candidate >= time_until_reset {
                will_last_to_reset = true;
            } else {
                eta_seconds = Some(candidate);
            }
        } else if actual == 0.0 {
            will_last_to_reset = true;
        }

        Some(UsagePace {
            status: classify(actual, fraction),
            delta_percent: actual - expected,
            eta_seconds,
            will_last_to_reset,
        })
    }
}

/// Classify weekly usage against the elapsed share of the window.
///
/// `Ahead` when usage exceeds the elapsed share by more than
/// [`PACE_TOLERANCE`], `Behind` when it trails by more than it, `OnTrack`
/// inside the band (boundaries inclusive).
pub fn classify(weekly_used_pct: f64, fraction_of_week_elapsed: f64) -> PaceStatus {
    let expected = fraction_of_week_elapsed.clamp(0.0, 1.0) * 100.0;
    let actual = weekly_used_pct.clamp(0.0, 100.0);
    if actual > expected + PACE_TOLERANCE {
        PaceStatus::Ahead
    } else if actual < expected - PACE_TOLERANCE {
        PaceStatus::Behind
    } else {
        PaceStatus::OnTrack
    }
}

/// Pace over the weekly window. `window` falls back to seven days when the
/// provider does not report one.
pub fn weekly_pace(
    weekly_used_pct: f64,
    weekly_reset_time: Option<DateTime<Utc>>,
    window: Option<Duration>,
    now: DateTime<Utc>,
) -> Option<UsagePace> {
    let window = window
        .filter(|w| *w > Duration::zero())
        .unwrap_or_else(|| Duration::seconds(WEEKLY_WINDOW_SECONDS));
    weekly_reset_time.and_then(|reset| UsagePace::for_window(weekly_used_pct, reset, window, now))
}

/// Weekly pace, defaulting to `OnTrack` with zero delta when the reset time
/// is unknown or out of range.
pub fn evaluate_weekly(
    weekly_used_pct: f64,
    weekly_reset_time: Option<DateTime<Utc>>,
    window: Option<Duration>,
    now: DateTime<Utc>,
) -> (PaceStatus, f64) {
    weekly_pace(weekly_used_pct, weekly_reset_time, window, now)
        .map(|pace| (pace.status, pace.delta_percent))
        .unwrap_or((PaceStatus::OnTrack, 0.0))
}

pub fn format_pace(status: PaceStatus, delta_percent: f64) -> String {
    let rounded = delta_percent.round() as i64;
    match status {
        PaceStatus::OnTrack => "On track".to_string(),
        PaceStatus::Ahead => format!("Ahead (+{}%)", rounded.abs()),
        PaceStatus::Behind => format!("Behind (-{}%)", rounded.abs()),
    }
}

pub fn format_pace_eta(pace: &UsagePace) -> Option<String> {
    if pace.will_last_to_reset {
        return Some("Lasts until reset".to_string());
    }
    let eta = pace.eta_seconds?;
    let text = format_duration(eta);
    if text == "now" {
        Some("Runs out now".to_string())
    } else {
        Some(format!("Runs out in {}", text))
    }
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 1.0 {
        return "now".to_string();
    }
    let total_minutes = (seconds / 60.0).ceil().max(1.0) as i64;
    let days = total_minutes / (24 * 60);
    let hours = (total_minutes / 60) % 24;
    let minutes = total_minutes % 60;

    if days > 0 && hours > 0 {
        format!("{}d {}h", days, hours)
    } else if days > 0 {
        format!("{}d", days)
    } else if hours > 0 && minutes > 0 {
        format!("{}h {}m", hours, minutes)
    } else if hours > 0 {
        format!("{}h", hours)
    } else {
        format!("{}m", minutes)
    }
}
