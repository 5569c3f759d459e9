//! Diagnostics to stderr, so `json` output on stdout stays parseable.

use tracing_subscriber::EnvFilter;

const LOG_LEVEL_ENV: &str = "USAGEBAR_LOG";
const LOG_FORMAT_ENV: &str = "USAGEBAR_LOG_FORMAT";
const DEFAULT_DIRECTIVE: &str = "warn";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Human,
    /// One JSON object per line
    Json,
}

impl LogFormat {
    pub fn from_arg(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" | "text" => Some(Self::Human),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Filter directive: `--verbose` wins, then `USAGEBAR_LOG`, then `RUST_LOG`.
fn directive(verbose: bool, usagebar_log: Option<String>, rust_log: Option<String>) -> String {
    if verbose {
        return "usagebar=debug".to_string();
    }
    usagebar_log
        .or(rust_log)
        .unwrap_or_else(|| DEFAULT_DIRECTIVE.to_string())
}

pub fn init(verbose: bool) {
    let directive = directive(
        verbose,
        non_empty_env(LOG_LEVEL_ENV),
        non_empty_env("RUST_LOG"),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let format = non_empty_env(LOG_FORMAT_ENV)
        .and_then(|v| LogFormat::from_arg(&v))
        .unwrap_or_default();

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_writer(std::io::stderr)
                .try_init()
                .ok();
        }
        LogFormat::Human => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init()
                .ok();
        }
    }
}
