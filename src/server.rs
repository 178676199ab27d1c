use axum::{
    routing::{get, MethodRouter},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::error::Result;
use crate::handlers;
use crate::metrics::stream;
use crate::middleware::instrument::{make_exp_handler, ExpHandler, InstrumentedHandler};
use crate::AppState;

/// Wrap `handler` and publish its counters under `name` in the state's registry.
fn instrument<H: ExpHandler>(
    state: &AppState,
    cfg: &Config,
    name: &str,
    handler: H,
) -> Result<MethodRouter<Arc<AppState>>> {
    Ok(Arc::new(configured(state, cfg, name, handler)?).route())
}

fn configured<H: ExpHandler>(
    state: &AppState,
    cfg: &Config,
    name: &str,
    handler: H,
) -> Result<InstrumentedHandler<H>> {
    let mut builder = InstrumentedHandler::builder(name, handler).granularity(cfg.granularity);
    if !cfg.log_requests {
        builder = builder.without_logging();
    }
    if let Some(windows) = cfg.windows_for(name)? {
        builder = builder.windows(windows);
    }
    let handler = builder.build(state.registry)?;
    tracing::info!(endpoint = name, windows = ?handler.windows().keys().collect::<Vec<_>>(), "instrumented endpoint");
    Ok(handler)
}

/// Builds the full Axum `Router`: instrumented demo endpoints plus the
/// polling routes.
pub fn create_router(state: Arc<AppState>, cfg: &Config) -> Result<Router> {
    Ok(Router::new()
        // ── Instrumented endpoints ──────────────────────────────
        .route("/api/hello", instrument(&state, cfg, "hello", handlers::hello)?)
        .route(
            "/api/plain/*rest",
            instrument(&state, cfg, "plain", make_exp_handler(handlers::plain))?,
        )
        .route("/api/flaky", instrument(&state, cfg, "flaky", handlers::flaky)?)
        .route("/api/slow", instrument(&state, cfg, "slow", handlers::slow)?)
        // ── Polling ─────────────────────────────────────────────
        .route("/debug/vars", get(stream::get_vars))
        .route("/debug/vars/stream", get(stream::vars_stream))
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        .layer(CorsLayer::permissive()))
}
