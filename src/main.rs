use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod cache;
mod clock;
mod config;
mod cost;
mod credentials;
mod error;
mod logging;
mod mock;
mod models;
mod normalize;
mod pace;
mod providers;
mod render;
mod scheduler;

use clock::{Clock, SystemClock};
use config::Config;
use credentials::{CredentialSource, CredentialStore};
use models::{AggregatedResult, ProviderId};
use providers::{ClaudeProvider, CodexProvider, ProviderFetcher};
use scheduler::{AggregationScheduler, SchedulerOptions};

#[derive(Parser)]
#[command(name = "usagebar", version)]
#[command(about = "Aggregate Claude and Codex subscription usage")]
struct Cli {
    /// Config file (default: ~/.config/usagebar/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use canned payloads instead of real providers
    #[arg(long, global = true)]
    mock: bool,

    /// Debug logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print all provider status to terminal
    Status,
    /// Fetch once and print the snapshot as JSON
    Json,
    /// Refresh on an interval, printing JSON and writing the snapshot file
    Watch {
        /// Snapshot file (default: ~/.cache/usagebar/snapshot.json)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the effective configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(Config::config_path);

    match cli.command {
        Commands::Config { init } => show_config(&config_path, init),
        Commands::Status => {
            let scheduler = load_scheduler(cli.config.as_deref(), cli.mock)?;
            let result = scheduler.refresh().await;
            tracing::debug!(
                connected = result.connected_count(),
                total = result.providers.len(),
                "Refresh complete"
            );
            print!("{}", render::render_status(&result, Utc::now()));
            Ok(())
        }
        Commands::Json => {
            let scheduler = load_scheduler(cli.config.as_deref(), cli.mock)?;
            let result = scheduler.refresh().await;
            println!("{}", result.to_json()?);
            Ok(())
        }
        Commands::Watch { output } => {
            let scheduler = load_scheduler(cli.config.as_deref(), cli.mock)?;
            let output = output.unwrap_or_else(AggregatedResult::default_path);
            watch(scheduler, output).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

fn load_scheduler(path: Option<&Path>, mock: bool) -> Result<AggregationScheduler> {
    let config = load_config(path)?;
    Ok(build_scheduler(&config, mock))
}

fn build_scheduler(config: &Config, mock: bool) -> AggregationScheduler {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timeout = config.fetch_timeout();

    let providers: Vec<Arc<dyn ProviderFetcher>> = config
        .providers()
        .into_iter()
        .map(|id| -> Arc<dyn ProviderFetcher> {
            if mock {
                return Arc::new(mock::MockFetcher::new(id, Arc::clone(&clock)));
            }
            match id {
                ProviderId::Claude => Arc::new(ClaudeProvider::new(timeout)),
                ProviderId::Codex => Arc::new(CodexProvider::new(timeout)),
            }
        })
        .collect();

    let credentials: Arc<dyn CredentialSource> = if mock {
        Arc::new(mock::mock_credentials())
    } else {
        Arc::new(CredentialStore::new(Arc::clone(&clock)))
    };

    AggregationScheduler::new(
        providers,
        credentials,
        clock,
        SchedulerOptions {
            refresh_interval: config.refresh_interval(),
            fetch_timeout: timeout,
        },
    )
}

fn show_config(path: &Path, init: bool) -> Result<()> {
    if init && !path.exists() {
        Config::default()
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        eprintln!("Wrote {}", path.display());
    }

    let config = Config::load_from(path)?;
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(&config)?);
    println!();
    println!("# claude credentials: {}", credentials::claude::credentials_path().display());
    println!("# codex credentials: {}", credentials::codex::credentials_path().display());

    config.validate()?;
    Ok(())
}

async fn watch(scheduler: AggregationScheduler, output: PathBuf) -> Result<()> {
    let mut updates = scheduler.subscribe();
    let mut refresh_signal = RefreshSignal::install();
    let handle = scheduler.start();

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let result = scheduler.latest();
                println!("{}", result.to_json()?);
                if let Err(e) = result.save(&output) {
                    tracing::warn!(path = %output.display(), error = %e, "Failed to write snapshot");
                }
            }
            _ = refresh_signal.recv() => {
                tracing::info!(phase = ?scheduler.phase(), "Refresh requested");
                handle.refresh_now();
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

/// SIGUSR1 requests an on-demand refresh.
#[cfg(unix)]
struct RefreshSignal(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl RefreshSignal {
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::user_defined1()) {
            Ok(signal) => Self(Some(signal)),
            Err(e) => {
                tracing::warn!(error = %e, "Could not install SIGUSR1 handler");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(signal) = self.0.as_mut() {
            if signal.recv().await.is_some() {
                return;
            }
            self.0 = None;
        }
        std::future::pending::<()>().await
    }
}

#[cfg(not(unix))]
struct RefreshSignal;

#[cfg(not(unix))]
impl RefreshSignal {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}
