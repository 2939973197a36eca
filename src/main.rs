//! Sentinel server: anti-cheat threat detection, ML anomaly scoring and
//! tamper-resistant ban persistence core for a game server.

use std::collections::HashMap;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use sentinel::config::SentinelConfig;
use sentinel::fingerprint::StaticComponentSource;
use sentinel::handlers;
use sentinel::state::{run_maintenance_loop, AppState};

#[tokio::main]
async fn main() {
    let filter = std::env::var("SENTINEL_LOG").unwrap_or_else(|_| "sentinel=debug,tower_http=info".to_string());
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::new(filter)).init();

    let config_path = std::env::var("SENTINEL_CONFIG").unwrap_or_else(|_| "sentinel.toml".to_string());
    let config = match SentinelConfig::load(&config_path) {
        Ok(c) => c.from_env_overrides(),
        Err(e) => {
            tracing::warn!(error = %e, path = %config_path, "falling back to default configuration");
            SentinelConfig::default().from_env_overrides()
        }
    };

    // A production deployment would back this with real platform probes
    // (WMI, /sys, ioreg); network capture and OS-specific fingerprinting
    // are non-goals here, so a fixed local identity stands in.
    let mut components = HashMap::new();
    components.insert("cpu_id", whoami_fallback("SENTINEL_HOST_CPU_ID", "unknown-cpu"));
    components.insert("mac_addresses", whoami_fallback("SENTINEL_HOST_MAC", "00:00:00:00:00:00"));
    let hardware_source = Box::new(StaticComponentSource(components));

    let bind_addr = config.server.bind_addr.clone();
    let state = AppState::new(config, hardware_source);

    if let Err(e) = state.orchestrator.initialize_all().await {
        tracing::error!(error = %e, "failed to initialize persistence mechanisms");
    }

    let maintenance_state = state.clone();
    tokio::spawn(run_maintenance_loop(maintenance_state));

    let app = Router::new()
        .route("/admin/status", get(handlers::get_status))
        .route("/admin/marker/arm", post(handlers::arm_marker))
        .route("/admin/marker/check", get(handlers::check_marker))
        .route("/admin/marker/remove-all", post(handlers::remove_all_markers))
        .route("/admin/rule/test", post(handlers::test_rules))
        .route("/ws", get(handlers::websocket_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    tracing::info!(%bind_addr, "sentinel listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind admin surface");
    axum::serve(listener, app).await.expect("server error");
}

fn whoami_fallback(env_key: &str, default: &str) -> String {
    std::env::var(env_key).unwrap_or_else(|_| default.to_string())
}
