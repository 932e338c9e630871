use std::sync::Arc;
use std::time::{Duration, Instant};

use tandem_server::api::{self, AppState};
use tandem_server::auth::TokenVerifier;
use tandem_server::clock::SystemClock;
use tandem_server::rate_limit::RateLimiter;
use tandem_server::registry::SessionRegistry;
use tandem_server::relay::SignalingRelay;
use tandem_server::{CallService, CallSettings, ServerConfig};
use tandem_store::Database;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tandem_server=debug")),
        )
        .init();

    info!("Starting Tandem signaling server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(
        instance = %config.instance_name,
        http = %config.http_addr,
        database = ?config.database_path,
        ring_timeout = ?config.ring_timeout,
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );
    if config.auth_pubkey == [0u8; 32] {
        warn!("AUTH_PUBKEY not set, every session token will be rejected");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = match &config.database_path {
        Some(path) => Database::open_at(path)?,
        None => Database::new()?,
    };
    info!(path = ?db.path(), "Database ready");

    let registry = SessionRegistry::new();
    let calls = CallService::new(
        db,
        SignalingRelay::new(registry.clone()),
        Arc::new(SystemClock),
        CallSettings {
            ring_timeout: config.ring_timeout,
            history_limit: config.history_limit,
        },
    );

    let app_state = AppState {
        calls: calls.clone(),
        registry,
        verifier: TokenVerifier::new(config.auth_pubkey),
        rate_limiter: RateLimiter::per_minute(config.rate_limit_per_min),
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Calls left ringing past the timeout, including any from before a restart
    if config.ring_timeout.is_some() {
        calls.spawn_sweeper(config.sweep_interval);
    }

    // Rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(Duration::from_secs(600)).await;
        }
    });

    // Session token cache cleanup (every 10 minutes)
    let verifier = app_state.verifier.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            verifier.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until shutdown
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
