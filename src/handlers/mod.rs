//! Demo endpoints served by the binary. Each one exercises a different path
//! through the instrumented wrapper.

use std::time::Duration;

use axum::{
    extract::{Query, Request},
    http::{header, HeaderValue, StatusCode},
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::transport::{ResponseSink, Sink};

#[derive(Debug, Deserialize)]
struct HelloParams {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Greeting<'a> {
    message: String,
    path: &'a str,
}

fn write_json<T: Serialize>(w: &Sink, status: StatusCode, body: &T) -> StatusCode {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            w.insert_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            w.write_header(status);
            w.write(&bytes);
            status
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode response body");
            w.write_header(StatusCode::INTERNAL_SERVER_ERROR);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// ─── GET /api/hello?name=... ─────────────────────────────────────

/// Reports its status directly. 400 without a `name`.
pub async fn hello(req: Request, w: Sink) -> StatusCode {
    let name = Query::<HelloParams>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(params)| params.name)
        .filter(|n| !n.is_empty());
    let Some(name) = name else {
        let body = serde_json::json!({ "error": "missing 'name' query parameter", "status": 400 });
        return write_json(&w, StatusCode::BAD_REQUEST, &body);
    };

    let greeting = Greeting {
        message: format!("hello, {name}"),
        path: req.uri().path(),
    };
    write_json(&w, StatusCode::OK, &greeting)
}

// ─── ANY /api/plain/* ────────────────────────────────────────────

/// Doesn't report a status; wrapped with `make_exp_handler`.
pub async fn plain(req: Request, w: Sink) {
    if req.uri().path().ends_with("/missing") {
        w.write_header(StatusCode::NOT_FOUND);
        w.write_str("not found\n");
        return;
    }
    w.write_header(StatusCode::OK);
    w.write_str("plain page\n");
}

// ─── GET /api/flaky ──────────────────────────────────────────────

/// Panics on roughly one request in five, after starting its body.
pub async fn flaky(_req: Request, w: Sink) -> StatusCode {
    let roll: u8 = rand::thread_rng().gen_range(0..100);

    w.write_header(StatusCode::OK);
    w.write_str("partial output");
    if roll < 20 {
        panic!("flaky handler rolled {roll}");
    }
    w.write_str(" completed\n");
    StatusCode::OK
}

// ─── GET /api/slow ───────────────────────────────────────────────

/// Sleeps 5–50 ms before answering.
pub async fn slow(_req: Request, w: Sink) -> StatusCode {
    let delay = Duration::from_millis(rand::thread_rng().gen_range(5..=50));
    tokio::time::sleep(delay).await;
    w.write_str(&format!("slept {} ms\n", delay.as_millis()));
    StatusCode::OK
}
