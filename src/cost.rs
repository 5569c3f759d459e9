//! Spend and token totals read from the provider CLIs' local logs.
//!
//! Everything here is best effort: unreadable files and malformed lines are
//! skipped, and a missing directory yields an empty summary.

use crate::models::CostSummary;
use chrono::{DateTime, Local, NaiveDate};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use walkdir::WalkDir;

const LOOKBACK_DAYS: i64 = 30;

/// USD per million tokens, as (input, output, cache read, cache write).
#[derive(Debug, Clone, Copy, PartialEq)]
struct ModelPricing {
    input: f64,
    output: f64,
    cache_read: f64,
    cache_write: f64,
}

const DEFAULT_PRICING: ModelPricing = ModelPricing {
    input: 3.0,
    output: 15.0,
    cache_read: 0.3,
    cache_write: 3.75,
};

const OPUS_PRICING: ModelPricing = ModelPricing {
    input: 15.0,
    output: 75.0,
    cache_read: 1.5,
    cache_write: 18.75,
};

/// Blended rate used to price today's output tokens.
const TODAY_USD_PER_MILLION: f64 = 5.0;

fn pricing_for(model: &str) -> ModelPricing {
    match model {
        "claude-opus-4-5-20251101" => OPUS_PRICING,
        _ => DEFAULT_PRICING,
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelTokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl ModelTokenUsage {
    fn cost(&self, pricing: ModelPricing) -> f64 {
        (self.input_tokens as f64 * pricing.input
            + self.output_tokens as f64 * pricing.output
            + self.cache_read_input_tokens as f64 * pricing.cache_read
            + self.cache_creation_input_tokens as f64 * pricing.cache_write)
            / 1_000_000.0
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsCache {
    #[serde(default)]
    model_usage: HashMap<String, ModelTokenUsage>,
}

fn in_window(date: NaiveDate, today: NaiveDate) -> bool {
    date <= today && (today - date).num_days() <= LOOKBACK_DAYS
}

/// Claude Code: output tokens from `projects/**/*.jsonl`, cost from
/// `stats-cache.json`.
pub fn claude_costs(data_dir: &Path, today: NaiveDate) -> CostSummary {
    let mut summary = CostSummary::default();

    let projects = data_dir.join("projects");
    for entry in WalkDir::new(&projects)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
    {
        let Some(modified) = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|t| DateTime::<Local>::from(t).date_naive())
        else {
            continue;
        };
        if !in_window(modified, today) {
            continue;
        }

        let tokens = claude_session_output_tokens(entry.path());
        if modified == today {
            summary.today_tokens += tokens;
        }
        summary.last_30_days_tokens += tokens;
    }

    if let Some(stats) = read_stats_cache(&data_dir.join("stats-cache.json")) {
        summary.last_30_days = stats
            .model_usage
            .iter()
            .map(|(model, usage)| usage.cost(pricing_for(model)))
            .sum();
    }
    summary.today = summary.today_tokens as f64 / 1_000_000.0 * TODAY_USD_PER_MILLION;

    tracing::debug!(
        today_tokens = summary.today_tokens,
        month_tokens = summary.last_30_days_tokens,
        "Scanned Claude local usage"
    );
    summary
}

fn read_stats_cache(path: &Path) -> Option<StatsCache> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(stats) => Some(stats),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Ignoring unreadable stats cache");
            None
        }
    }
}

fn claude_session_output_tokens(path: &Path) -> u64 {
    let Ok(file) = File::open(path) else {
        return 0;
    };
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str::<Value>(&line).ok())
        .filter_map(|entry| {
            entry
                .get("message")?
                .get("usage")?
                .get("output_tokens")?
                .as_u64()
        })
        .sum()
}

/// Codex CLI: `sessions/YYYY/MM/DD/*.jsonl`, dated by directory. Each
/// session contributes the output tokens of its last `token_count` event.
pub fn codex_costs(data_dir: &Path, today: NaiveDate) -> CostSummary {
    let mut summary = CostSummary::default();
    let sessions = data_dir.join("sessions");

    for entry in WalkDir::new(&sessions)
        .min_depth(4)
        .max_depth(4)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
    {
        let Some(date) = session_date(&sessions, entry.path()) else {
            continue;
        };
        if !in_window(date, today) {
            continue;
        }

        let tokens = codex_session_output_tokens(entry.path());
        if date == today {
            summary.today_tokens += tokens;
        }
        summary.last_30_days_tokens += tokens;
    }

    tracing::debug!(
        today_tokens = summary.today_tokens,
        month_tokens = summary.last_30_days_tokens,
        "Scanned Codex local usage"
    );
    summary
}

fn session_date(root: &Path, file: &Path) -> Option<NaiveDate> {
    let relative = file.strip_prefix(root).ok()?;
    let mut parts = relative
        .components()
        .map(|c| c.as_os_str().to_str().and_then(|s| s.parse::<u32>().ok()));
    let year = parts.next()??;
    let month = parts.next()??;
    let day = parts.next()??;
    NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, day)
}

fn codex_session_output_tokens(path: &Path) -> u64 {
    let Ok(file) = File::open(path) else {
        return 0;
    };
    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter_map(|line| serde_json::from_str::<Value>(&line).ok())
        .filter(|entry| entry.get("type").and_then(Value::as_str) == Some("event_msg"))
        .filter_map(|entry| {
            let payload = entry.get("payload")?;
            if payload.get("type").and_then(Value::as_str) != Some("token_count") {
                return None;
            }
            Some(
                payload
                    .get("info")
                    .and_then(|i| i.get("total_token_usage"))
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            )
        })
        .last()
        .unwrap_or(0)
}
