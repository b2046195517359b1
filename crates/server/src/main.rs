//! depot server binary.

use anyhow::{Context, Result};
use clap::Parser;
use depot_core::config::AppConfig;
use depot_server::{AppState, Expirer, create_router, expirer_router};
use depot_storage::ShardedStore;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// depot - a resumable file-upload server
#[derive(Parser, Debug)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "DEPOT_CONFIG",
        default_value = "config/depot.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("depot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override
    // everything).
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("no config file found at {}", args.config);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("DEPOT_") && key != "DEPOT_CONFIG");

    if !has_config_file && !has_env_config {
        tracing::warn!(
            "no configuration provided, using defaults; \
             set --config or DEPOT_-prefixed environment variables"
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("DEPOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // Register Prometheus metrics
    depot_server::metrics::register_metrics();
    tracing::info!("prometheus metrics registered");

    // Initialize the metadata store; migrations run here and failures are
    // fatal.
    let metadata = depot_metadata::from_config(&config.database, &config.expiration)
        .await
        .context("failed to initialize metadata store")?;
    metadata
        .health_check()
        .await
        .context("metadata store health check failed")?;
    tracing::info!("metadata store initialized");

    // Blob store and event bus.
    let store = ShardedStore::new(&config.storage, &config.expiration, metadata.clone());
    let events = depot_server::events::EventBus::new();
    let _event_logger = depot_server::events::spawn_event_logger(events.clone());
    tracing::info!(base_path = %config.storage.base_path.display(), "blob store initialized");

    let gc_interval = config.expiration.gc_interval();
    let state = AppState::new(config.clone(), store, metadata.clone(), events.clone());

    // Expiration garbage collector.
    let expirer = Expirer::spawn(
        metadata,
        expirer_router(state.clone()),
        gc_interval,
        depot_server::expirer::DEFAULT_ID_PAUSE,
    );
    tracing::info!(interval_secs = gc_interval.as_secs(), "expirer spawned");

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    expirer.stop();
    events.close().await;
    Ok(())
}
