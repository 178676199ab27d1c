use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use endpoint_stats::{config::Config, server, AppState, Registry};

#[tokio::main]
async fn main() {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── 1. Config ────────────────────────────────────────────────
    let cfg = Config::from_env().expect("config load failed");
    cfg.apply_globals().expect("invalid config");
    let listen: SocketAddr = cfg.listen.parse().expect("listen must be a valid SocketAddr");

    // ── 2. Build shared state ────────────────────────────────────
    let state = Arc::new(AppState {
        registry: Registry::global(),
        poll_interval: cfg.poll_interval().expect("invalid poll_interval"),
    });

    // ── 3. Build Axum router ─────────────────────────────────────
    let app = server::create_router(state, &cfg).expect("failed to build router");

    // ── 4. Bind & serve ──────────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .expect("failed to bind listen address");

    tracing::info!(%listen, granularity = cfg.granularity, "endpoint-stats listening");
    tracing::info!("counters → http://{listen}/debug/vars");

    axum::serve(listener, app).await.expect("server exited with error");
}
