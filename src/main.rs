use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_core::Subscription;
use snowrelay::config::Config;
use snowrelay::gateway::{self, AppState};
use snowrelay::rate_limit::{self, ClientRateLimiter};
use snowrelay::relay::{self, Relay};

#[derive(Parser)]
#[command(name = "snowrelay")]
#[command(about = "Nostr relay with verified ingestion and cached filter queries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (default: ./snowrelay.toml if present)
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway
    Serve,
    /// Submit events from JSON files and print the OK message for each
    Ingest {
        /// Files holding one event object or an array of events
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Resolve filters against the store and print EVENT/EOSE messages
    Query {
        /// Filter objects as JSON, e.g. '{"kinds":[1],"limit":10}'
        #[arg(required = true)]
        filters: Vec<String>,
        /// Subscription id used in the printed messages
        #[arg(long, default_value = "cli")]
        subscription: String,
    },
    /// Validate configuration and open the database
    Check,
}

/// How often idle rate-limit buckets are dropped.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).with_context(|| "Failed to load configuration")?;

    init_logging(&config.logging.level)?;

    config.validate().with_context(|| "Configuration validation failed")?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server(config).await,
        Commands::Ingest { files } => ingest_files(&config, &files).await,
        Commands::Query {
            filters,
            subscription,
        } => query(&config, &filters, subscription).await,
        Commands::Check => check_config(&config).await,
    }
}

async fn run_server(config: Config) -> Result<()> {
    tracing::info!("Starting snowrelay v{}", env!("CARGO_PKG_VERSION"));

    let relay = Relay::open(&config)?;
    let limiter = ClientRateLimiter::from_config(&config.rate_limit).map(Arc::new);
    match &limiter {
        Some(limiter) => {
            tracing::info!(
                "Rate limit: {}/s, burst {}",
                config.rate_limit.per_second,
                config.rate_limit.burst
            );
            rate_limit::spawn_pruner(Arc::clone(limiter), PRUNE_INTERVAL);
        }
        None => tracing::info!("Rate limiting disabled"),
    }

    let app = gateway::router(AppState { relay, limiter }, &config.server);
    let bind = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;

    gateway::serve(listener, app, async {
        if let Err(e) = wait_for_shutdown().await {
            tracing::error!("Shutdown signal handling failed: {}", e);
        }
        tracing::info!("Received shutdown signal, stopping gateway...");
    })
    .await
}

async fn ingest_files(config: &Config, files: &[PathBuf]) -> Result<()> {
    let relay = Relay::open(config)?;
    let mut accepted = 0usize;
    let mut total = 0usize;

    for path in files {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let events = relay::parse_events(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        for event in events {
            let id = event.id.clone();
            let outcome = relay.pipeline.ingest(event).await;
            if outcome.is_accepted() {
                accepted += 1;
            }
            total += 1;
            println!("{}", outcome.ack(&id).to_json());
        }
    }

    tracing::info!("Ingested {} of {} event(s)", accepted, total);
    Ok(())
}

async fn query(config: &Config, filters: &[String], subscription: String) -> Result<()> {
    let filters = filters
        .iter()
        .map(|raw| serde_json::from_str::<serde_json::Value>(raw).with_context(|| format!("Filter is not valid JSON: {}", raw)))
        .collect::<Result<Vec<_>>>()?;

    let relay = Relay::open(config)?;
    let messages = relay
        .engine
        .subscribe(&Subscription::new(subscription, filters))
        .await
        .context("Query failed")?;
    for message in messages {
        println!("{}", message.to_json());
    }
    Ok(())
}

async fn check_config(config: &Config) -> Result<()> {
    println!("Checking configuration...");
    println!("✓ Configuration is valid");
    println!("  Bind address: {}", config.server.bind);

    let relay = Relay::open(config).with_context(|| "Failed to open database")?;
    let count = relay.store().count().await.context("Failed to read from database")?;
    println!("✓ Database opened: {}", config.store.db_path);
    println!("  Stored events: {}", count);

    if config.ingest.verify_event_id {
        println!("✓ Event ids must match content");
    }
    match ClientRateLimiter::from_config(&config.rate_limit) {
        Some(_) => println!(
            "✓ Rate limit: {}/s, burst {}",
            config.rate_limit.per_second, config.rate_limit.burst
        ),
        None => println!("⚠ Rate limiting is disabled"),
    }

    println!("\nConfiguration check completed successfully!");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        },
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        },
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact(),
        )
        .init();

    Ok(())
}
