//! Upstream-account load balancer gateway.
//!
//! Single-binary service that:
//! 1. Loads the typed configuration (spec §9) and opens the account store.
//! 2. Selects an eligible upstream account per request through the Load
//!    Balancer Facade, keeping its token fresh and its usage snapshot warm.
//! 3. Proxies the request to the single upstream service, applying the
//!    streaming failover policy on failure (spec §7).
//! 4. Exposes an operator-only admin API (account onboarding, pool status,
//!    dashboard settings) and Prometheus metrics on a separate listener.

mod admin;
mod config;
mod metrics;
mod proxy;
mod state;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use store::{AccountStorePort, SqliteAccountStore};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::state::GatewayState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting lb-gateway");

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(String::as_str);

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.listen_addr,
        admin_listen_addr = %config.admin_listen_addr,
        upstream = %config.upstream_base_url,
        pinned_accounts = config.pinned_account_ids.len(),
        "configuration loaded"
    );

    let store: Arc<dyn AccountStorePort> = Arc::new(
        SqliteAccountStore::open(&config.store_path)
            .await
            .with_context(|| format!("failed to open account store at {}", config.store_path.display()))?,
    );

    let cryptor = Arc::new(
        auth::TokenCryptor::load_or_generate(&config.encryption_key_file)
            .await
            .context("failed to load or generate the token encryption key")?,
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream_timeout_secs))
        .build()
        .context("failed to build upstream HTTP client")?;

    let facade_config = pool::FacadeConfig {
        usage_refresh_enabled: config.usage_refresh_enabled,
        usage_refresh_interval_seconds: config.usage_refresh_interval_seconds,
        usage_url: config.usage_url(),
        snapshot_ttl_seconds: config.snapshot_ttl_seconds,
        tier_weights: config.tier_weights.clone().into(),
        tier_capacity_credits: config.tier_capacity_credits.clone(),
        proactive_refresh_minutes: config.proactive_refresh_minutes,
        escalation: config.escalation(),
        sticky_map_capacity: config.sticky_map_capacity,
    };

    let facade = Arc::new(pool::Facade::new(
        store.clone(),
        cryptor.clone(),
        http_client.clone(),
        config.oauth.clone(),
        facade_config,
    ));

    // The pinned-account list and prefer-earlier-reset flag live in the
    // dynamic `dashboard_settings` row (spec §6): the dashboard is the
    // source of truth once it's been touched. The config file only seeds
    // whichever of those the dashboard hasn't set yet, so a fresh store on
    // first boot still honours the operator's config-file defaults.
    let existing_settings = store
        .load_settings()
        .await
        .context("failed to load dashboard settings")?;
    if existing_settings.pinned_account_ids.is_empty() && !config.pinned_account_ids.is_empty() {
        store
            .save_settings(store::DashboardSettings {
                pinned_account_ids: config.pinned_account_ids.clone(),
                prefer_earlier_reset: existing_settings.prefer_earlier_reset || config.prefer_earlier_reset,
            })
            .await
            .context("failed to seed dashboard settings from config")?;
    }

    let gateway_state = GatewayState {
        facade,
        store,
        cryptor,
        http_client,
        endpoints: config.oauth.clone(),
        responses_url: config.responses_url(),
        static_headers: config.headers.clone(),
        proactive_refresh_minutes: config.proactive_refresh_minutes,
        requests_total: Arc::new(AtomicU64::new(0)),
    };

    let metrics_handle = metrics::install_recorder();

    let proxy_router = Router::new().fallback(proxy_handler).with_state(gateway_state.clone());

    let health_router = Router::new()
        .route("/health", get(health_handler))
        .with_state(gateway_state.requests_total.clone());

    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_handle);

    let admin_router = admin::build_admin_router(AdminState::new(gateway_state))
        .merge(metrics_router)
        .merge(health_router);

    let proxy_listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;
    let admin_listener = TcpListener::bind(config.admin_listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.admin_listen_addr))?;

    info!(addr = %config.listen_addr, "proxy listening");
    info!(addr = %config.admin_listen_addr, "admin API listening");

    let proxy_server = axum::serve(proxy_listener, proxy_router).with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_router).with_graceful_shutdown(shutdown_signal());

    tokio::try_join!(
        async { proxy_server.await.context("proxy server error") },
        async { admin_server.await.context("admin server error") },
    )?;

    info!("shutdown complete");
    Ok(())
}

async fn proxy_handler(
    State(state): State<GatewayState>,
    request: axum::http::Request<axum::body::Body>,
) -> axum::response::Response {
    state.requests_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, 32 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "failed to buffer request body");
            return axum::http::StatusCode::BAD_REQUEST.into_response();
        }
    };
    proxy::proxy_request(&state, parts.method, parts.headers, body).await
}

async fn health_handler(State(requests_total): State<Arc<AtomicU64>>) -> impl IntoResponse {
    let requests = requests_total.load(std::sync::atomic::Ordering::Relaxed);
    axum::Json(serde_json::json!({ "status": "healthy", "requests_served": requests }))
}

async fn metrics_handler(State(handle): State<metrics_exporter_prometheus::PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
