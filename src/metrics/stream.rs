use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use crate::AppState;

// ─── GET /debug/vars ─────────────────────────────────────────────
/// Every registered counter set as one JSON object, read at request time.

pub async fn get_vars(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.registry.snapshot())
}

// ─── GET /debug/vars/stream ──────────────────────────────────────
/// Server-Sent Events endpoint.
/// Pushes a registry snapshot every `poll_interval` so a dashboard can
/// follow the rate counters without polling.

pub async fn vars_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(state.poll_interval);

    let stream = IntervalStream::new(interval).map(move |_| {
        let json = serde_json::to_string(&state.registry.snapshot()).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}
