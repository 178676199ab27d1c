//! The response side of a wrapped handler.
//!
//! Handlers write through a `ResponseSink` instead of returning an axum
//! `Response`, so the instrumented wrapper can buffer their output and drop
//! it if they panic halfway through.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

/// Where a handler writes its response.
pub trait ResponseSink: Send + Sync {
    /// Set the response status. Only the first call takes effect.
    fn write_header(&self, status: StatusCode);

    fn insert_header(&self, name: HeaderName, value: HeaderValue);

    /// Append to the body. Implies `200 OK` if no status was set yet.
    fn write(&self, chunk: &[u8]);

    fn write_str(&self, s: &str) {
        self.write(s.as_bytes());
    }
}

/// Shared handle handlers receive.
pub type Sink = Arc<dyn ResponseSink>;

// ─── ResponseWriter ──────────────────────────────────────────────

/// Buffered sink that turns into an axum `Response` once the handler is done.
/// Clones share the same buffer.
#[derive(Clone, Default)]
pub struct ResponseWriter {
    inner: Arc<Mutex<Buffered>>,
}

#[derive(Default)]
struct Buffered {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status written so far, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.inner.lock().status
    }

    pub fn body_len(&self) -> usize {
        self.inner.lock().body.len()
    }
}

impl ResponseSink for ResponseWriter {
    fn write_header(&self, status: StatusCode) {
        let mut buf = self.inner.lock();
        match buf.status {
            None => buf.status = Some(status),
            Some(first) => {
                tracing::debug!(%first, ignored = %status, "superfluous write_header call");
            }
        }
    }

    fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner.lock().headers.insert(name, value);
    }

    fn write(&self, chunk: &[u8]) {
        let mut buf = self.inner.lock();
        buf.status.get_or_insert(StatusCode::OK);
        buf.body.extend_from_slice(chunk);
    }
}

impl IntoResponse for ResponseWriter {
    fn into_response(self) -> Response {
        let buf = std::mem::take(&mut *self.inner.lock());
        let mut response = Response::new(Body::from(buf.body));
        *response.status_mut() = buf.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = buf.headers;
        response
    }
}

// ─── StatusRecorder ──────────────────────────────────────────────

/// Sink decorator that remembers the first status set on it.
///
/// Every call is forwarded unchanged to the wrapped sink.
pub struct StatusRecorder {
    inner: Sink,
    status: OnceCell<StatusCode>,
}

impl StatusRecorder {
    pub fn new(inner: Sink) -> Self {
        Self {
            inner,
            status: OnceCell::new(),
        }
    }

    /// First status observed, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.status.get().copied()
    }

    /// First status observed, or 500 when the handler never set one.
    pub fn status_or_default(&self) -> StatusCode {
        self.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl ResponseSink for StatusRecorder {
    fn write_header(&self, status: StatusCode) {
        let _ = self.status.set(status);
        self.inner.write_header(status);
    }

    fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.inner.insert_header(name, value);
    }

    fn write(&self, chunk: &[u8]) {
        self.inner.write(chunk);
    }
}
