//! Token gate service.
//!
//! Serves the health, metrics and caller-identity endpoints behind the
//! bearer token gate.

use auth_gate::auth::{HttpKeySource, KeyCache, TokenValidator};
use auth_gate::config::Config;
use auth_gate::gate::AuthGate;
use auth_gate::observability::metrics::init_metrics_recorder;
use auth_gate::routes::{self, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting token gate");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        issuer = %config.issuer,
        jwks_url = %config.jwks_url,
        audience_checked = config.audience.is_some(),
        bind_address = %config.bind_address,
        jwt_clock_skew_seconds = config.jwt_clock_skew_seconds,
        jwks_cache_ttl_seconds = config.jwks_cache_ttl_seconds,
        jwks_miss_cooldown_seconds = config.jwks_miss_cooldown_seconds,
        "Configuration loaded successfully"
    );

    // Metrics recorder must be installed before anything records
    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("Failed to initialize metrics: {}", e);
        e
    })?;

    // Wire key cache -> validator -> gate
    let key_source =
        HttpKeySource::new().with_endpoint(config.issuer.clone(), config.jwks_url.clone());
    let key_cache = KeyCache::with_miss_cooldown(
        Arc::new(key_source),
        Duration::from_secs(config.jwks_cache_ttl_seconds),
        Duration::from_secs(config.jwks_miss_cooldown_seconds),
    );

    let mut validator = TokenValidator::new(key_cache, config.issuer.clone())
        .with_clock_skew(Duration::from_secs(config.jwt_clock_skew_seconds));
    if let Some(audience) = &config.audience {
        validator = validator.with_audience(audience.clone());
    }
    let gate = Arc::new(AuthGate::with_mapping(validator, config.claim_mapping.clone()));

    // Parse bind address before moving config
    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;

    let state = Arc::new(AppState { config, gate });
    let app = routes::build_routes(state, metrics_handle);

    info!("Token gate listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Token gate shutdown complete");

    Ok(())
}

/// Install the tracing subscriber. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "auth_gate=debug,tower_http=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
