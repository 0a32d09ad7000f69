use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use event_sync::{
    search, EventStore, EventSummary, ProviderClient, SearchFilter, Settings, SyncOrchestrator, SyncReport,
};

#[derive(Parser)]
#[command(name = "event-sync")]
#[command(about = "Synchronizes provider event feeds into the local event store")]
#[command(version = "0.1.0")]
struct Cli {
    /// TOML settings file; without it settings come from PROVIDER_API_URL and friends
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync over every configured provider
    Sync,
    /// Keep syncing on a fixed interval until interrupted
    Watch {
        #[arg(long, default_value_t = 300)]
        interval_secs: u64,
    },
    /// Print stored events with plans starting in the given range as JSON
    Search {
        /// Range start, RFC 3339
        #[arg(long)]
        starts_at: DateTime<Utc>,
        /// Range end, RFC 3339
        #[arg(long)]
        ends_at: DateTime<Utc>,
        /// Include records missing from their provider's last complete sync
        #[arg(long)]
        include_stale: bool,
        /// Only events that were ever sold online
        #[arg(long)]
        online_only: bool,
        /// Print one summary line per event instead of the full hierarchy
        #[arg(long)]
        summary: bool,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("event_sync=info,info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<Settings> {
    let settings = match path {
        Some(path) => Settings::from_file(path)?,
        None => Settings::from_env().context("no --config given and environment is incomplete")?,
    };
    Ok(settings)
}

fn log_report(report: &SyncReport) {
    for outcome in &report.outcomes {
        match &outcome.error {
            Some(err) => warn!(provider = %outcome.provider, state = %outcome.state, error = %err, "provider result"),
            None => info!(
                provider = %outcome.provider,
                state = %outcome.state,
                created = outcome.counts.created(),
                updated = outcome.counts.updated(),
                item_errors = outcome.item_errors.len(),
                "provider result"
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let settings = load_settings(cli.config.as_ref())?;
    let store = EventStore::open(&settings.database_path, settings.pool_size)
        .with_context(|| format!("opening event store at {}", settings.database_path.display()))?;

    match cli.command {
        Commands::Sync => {
            let client = Arc::new(ProviderClient::new(settings.retry.clone()));
            let orchestrator = SyncOrchestrator::new(store, client, settings.sync.clone());
            let report = orchestrator.run_sync(&settings.providers, Utc::now()).await;
            log_report(&report);
        }
        Commands::Watch { interval_secs } => {
            let client = Arc::new(ProviderClient::new(settings.retry.clone()));
            let orchestrator = SyncOrchestrator::new(store, client, settings.sync.clone());

            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_secs, providers = settings.providers.len(), "watching providers");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = orchestrator.run_sync(&settings.providers, Utc::now()).await;
                        log_report(&report);
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("shutting down");
                        break;
                    }
                }
            }
        }
        Commands::Search {
            starts_at,
            ends_at,
            include_stale,
            online_only,
            summary,
        } => {
            let filter = SearchFilter {
                include_stale,
                ever_online_only: online_only,
            };
            let events = tokio::task::spawn_blocking(move || search(&store, starts_at, ends_at, &filter)).await??;

            let output = if summary {
                let summaries: Vec<EventSummary> = events.iter().map(EventSummary::from_record).collect();
                serde_json::to_string_pretty(&summaries)?
            } else {
                serde_json::to_string_pretty(&events)?
            };
            println!("{output}");
        }
    }

    Ok(())
}
