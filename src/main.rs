use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use outreach_limiter::clock::{Clock, ManualClock, SystemClock};
use outreach_limiter::config::{Settings, StoreBackend};
use outreach_limiter::ratelimit::{PlatformRegistry, DEFAULT_ACTION};
use outreach_limiter::store::MemoryStore;

#[derive(Debug, Parser)]
#[command(name = "outreach-limiter", version, about = "Per-platform rate limiting engine")]
struct Cli {
    /// Settings file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List registered platforms and their limits
    Platforms,
    /// Show the backoff for a number of consecutive errors (0-indexed)
    Backoff {
        #[arg(allow_negative_numbers = true)]
        errors: i64,
    },
    /// Run acquire with simulated time
    Simulate {
        #[arg(long)]
        platform: String,
        #[arg(long, default_value = "demo-account")]
        account: String,
        #[arg(long, default_value = DEFAULT_ACTION)]
        action: String,
        #[arg(long, default_value_t = 10)]
        attempts: u32,
        /// Simulated seconds between attempts
        #[arg(long, default_value_t = 0)]
        step_secs: i64,
        /// Use the store backend from settings instead of a private in-memory one
        #[arg(long)]
        configured_store: bool,
    },
    /// Run a mesh store node until interrupted
    Node,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Command::Platforms => {
            let registry = PlatformRegistry::from_settings(
                &settings,
                Arc::new(MemoryStore::new()),
                Arc::new(SystemClock),
            )?;
            println!(
                "{:<12} {:>8} {:>8} {:>10} {:>10} {:>8}",
                "platform", "requests", "window", "min_ms", "max_ms", "daily"
            );
            for (name, config) in registry.platforms() {
                let daily = config
                    .daily_limit()
                    .map_or_else(|| "-".to_string(), |d| d.to_string());
                println!(
                    "{:<12} {:>8} {:>7}s {:>10} {:>10} {:>8}",
                    name,
                    config.requests_per_window(),
                    config.window_seconds(),
                    config.min_delay_ms(),
                    config.max_delay_ms(),
                    daily
                );
            }
        }
        Command::Backoff { errors } => {
            let registry = PlatformRegistry::from_settings(
                &settings,
                Arc::new(MemoryStore::new()),
                Arc::new(SystemClock),
            )?;
            // Any platform's limiter carries the configured backoff constants.
            let limiter = registry.get_platform_rate_limiter("gmail")?;
            let delay = limiter.calculate_exponential_backoff(errors)?;
            println!("{}s", delay.as_secs_f64());
        }
        Command::Simulate {
            platform,
            account,
            action,
            attempts,
            step_secs,
            configured_store,
        } => {
            let clock = ManualClock::new(SystemClock.now());
            let mut store_settings = settings.store.clone();
            if !configured_store {
                store_settings.backend = StoreBackend::Memory;
            }
            let store = store_settings.build(Arc::new(clock.clone())).await?;

            {
                let registry = PlatformRegistry::from_settings(
                    &settings,
                    store.state_store(),
                    Arc::new(clock.clone()),
                )?;
                let limiter = registry.get_platform_rate_limiter(&platform)?;
                let start = clock.now();

                for attempt in 1..=attempts {
                    let permitted = limiter.acquire(&account, &action, None).await?;
                    let status = limiter.status(&account, &action, None).await?;
                    println!(
                        "t+{:>6}s attempt {:>3}: {:<7} remaining={} daily_remaining={} wait={:.1}s",
                        (clock.now() - start).num_seconds(),
                        attempt,
                        if permitted { "allowed" } else { "denied" },
                        status.remaining,
                        status
                            .daily_remaining
                            .map_or_else(|| "-".to_string(), |d| d.to_string()),
                        status.wait.as_secs_f64()
                    );
                    clock.advance(chrono::Duration::seconds(step_secs));
                }
            }

            store.shutdown().await?;
        }
        Command::Node => {
            if settings.store.backend != StoreBackend::Mesh {
                info!("store.backend is not 'mesh'; starting a mesh node anyway");
            }
            let mut store_settings = settings.store.clone();
            store_settings.backend = StoreBackend::Mesh;
            let store = store_settings.build(Arc::new(SystemClock)).await?;
            if let Some(mesh) = store.mesh() {
                info!(node = %mesh.node_id(), "Mesh node running");
            }

            shutdown_signal().await;

            store.shutdown().await?;
            info!("Mesh node stopped");
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
