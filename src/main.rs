use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use picscribe::api::{auth::ensure_admin, metrics::init_metrics, rate_limit::spawn_cleanup_task};
use picscribe::config::Config;
use picscribe::crypto::optional_key;
use picscribe::vision::{ApiKeyResolver, IdeogramClient};
use picscribe::AppState;

#[derive(Parser, Debug)]
#[command(name = "picscribe")]
#[command(author, version, about = "A credits-based image description service", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "picscribe.toml", env = "PICSCRIBE_CONFIG")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config)?;

    // Initialize logging
    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting picscribe v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.server.data_dir.display()
        )
    })?;

    // Initialize database
    let db = picscribe::db::init(&config.server.data_dir).await?;

    // Ensure the bootstrap admin exists
    ensure_admin(&db, &config).await?;

    let metrics_handle = init_metrics()?;

    // Vision provider; the API key is looked up per request
    let keys = ApiKeyResolver::new(
        Some(db.clone()),
        optional_key(config.auth.encryption_key.as_deref()),
        config.vision.api_key.clone(),
    );
    let vision = Arc::new(
        IdeogramClient::from_config(&config.vision, keys)
            .context("Failed to create vision client")?,
    );
    if config.vision.fallback_enabled {
        tracing::info!("Local fallback describer enabled for requests without an API key");
    }

    let state = Arc::new(AppState::new(config.clone(), db.clone(), vision).with_metrics(metrics_handle));

    spawn_cleanup_task(
        state.rate_limiter.clone(),
        db.clone(),
        config.rate_limit.cleanup_interval,
    );

    // Create API router
    let api_router = picscribe::api::create_router(state.clone());

    // Serve the frontend with SPA fallback
    let static_dir = config.server.static_dir.clone();
    let index_file = static_dir.join("index.html");
    let serve_static = ServeDir::new(&static_dir).not_found_service(ServeFile::new(&index_file));

    // API first, then static files as fallback
    let app = axum::Router::new()
        .merge(api_router)
        .fallback_service(serve_static);

    let api_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.api_port)
        .parse()
        .with_context(|| "Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(api_addr).await?;

    tracing::info!("API server listening on http://{}", api_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
