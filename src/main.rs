//! Bustrack Monitor
//!
//! Connects every configured realtime transport, logs each normalized event
//! and reports health until interrupted.
//!
//! Run with: cargo run -- --api-url http://localhost:3001
//!
//! `RUST_LOG` overrides the configured log level.

use anyhow::Context;
use bustrack::config::{generate_default_config, Config};
use bustrack::interaction::ThrottleOptions;
use bustrack::pool::{ConnectionPool, TungsteniteConnector};
use bustrack::realtime::{
    HttpHealthProbe, ManagerConfig, RealtimeEvent, RealtimeManager, StaticToken, Transports,
    BUS_LOCATION_UPDATE, EVENT_TYPES,
};
use bustrack::sse::{HttpEventSourceFactory, SseClient};
use bustrack::subscriptions::{PhoenixConfig, PhoenixReplicationClient, SubscriptionService};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "bustrack")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Realtime bus tracking monitor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: search standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP API base URL
    #[arg(long)]
    api_url: Option<String>,

    /// WebSocket base URL
    #[arg(long)]
    ws_url: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a commented default config file
    GenerateConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::GenerateConfig) = cli.command {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load_default(),
    };
    if let Some(url) = cli.api_url {
        config.endpoints.api_url = Some(url);
    }
    if let Some(url) = cli.ws_url {
        config.endpoints.ws_url = Some(url);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    init_logging(&config);
    tracing::info!("Bustrack monitor v{}", env!("CARGO_PKG_VERSION"));

    let manager_config = config.manager_config();
    let manager = build_manager(&config, manager_config.clone())?;

    // Location ticks arrive several times a second per bus
    let location_window = Duration::from_millis(config.realtime.location_throttle_ms);
    manager.on_throttled(
        BUS_LOCATION_UPDATE,
        ThrottleOptions::new(location_window),
        RealtimeEvent::bus_id,
        log_event,
    );
    for event_type in EVENT_TYPES.into_iter().filter(|t| *t != BUS_LOCATION_UPDATE) {
        manager.on(event_type, log_event);
    }

    let summary = manager.initialize().await;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let mut report = tokio::time::interval(manager_config.health_check_interval);
    report.tick().await;

    loop {
        tokio::select! {
            _ = report.tick() => {
                let status = manager.status();
                match status.last_health {
                    Some(health) => tracing::info!(
                        websocket = health.websocket,
                        subscriptions = health.subscriptions,
                        sse = health.sse,
                        overall = health.overall,
                        events = status.stats.total,
                        "Health"
                    ),
                    None => tracing::info!(events = status.stats.total, "No health report yet"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                break;
            }
        }
    }

    tracing::info!("Shutting down...");
    manager.destroy();
    tracing::info!("Bustrack monitor stopped");
    Ok(())
}

fn log_event(event: &RealtimeEvent) {
    tracing::info!(
        event_type = %event.event_type,
        source = %event.source,
        priority = %event.priority,
        data = %event.data,
        "Realtime event"
    );
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("bustrack={}", config.logging.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_manager(config: &Config, manager_config: ManagerConfig) -> anyhow::Result<RealtimeManager> {
    let api_url = config.endpoints.resolve_api_url();
    tracing::info!(api = %api_url, ws = %manager_config.ws_url, "Resolved endpoints");

    let pool = ConnectionPool::with_settings(
        Arc::new(TungsteniteConnector::new()),
        config.pool_settings(),
    );

    let phoenix = match config.phoenix_config() {
        Some(phoenix) => phoenix,
        None => {
            tracing::info!("Supabase realtime disabled (set BUSTRACK_SUPABASE_URL and BUSTRACK_SUPABASE_KEY to enable)");
            PhoenixConfig::default()
        }
    };
    let replication = PhoenixReplicationClient::new(phoenix).context("building replication client")?;

    let sse = SseClient::new(config.sse_config(), Arc::new(HttpEventSourceFactory::new()));

    let probe = HttpHealthProbe::new(&api_url, Duration::from_secs(config.realtime.probe_timeout_secs))
        .context("building health probe")?;

    Ok(RealtimeManager::new(
        manager_config,
        Transports {
            pool,
            subscriptions: SubscriptionService::new(Arc::new(replication)),
            sse,
        },
        Arc::new(probe),
        Arc::new(StaticToken::new(config.realtime.auth_token.clone())),
    ))
}
