use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode, Uri};
use once_cell::sync::Lazy;
use parking_lot::RwLock;

/// One completed request, as handed to a `RequestLogger`.
#[derive(Debug, Clone, Copy)]
pub struct ResponseLog<'a> {
    pub endpoint: &'a str,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub status: StatusCode,
    pub elapsed: Duration,
}

/// Receives the per-request summary lines of instrumented handlers.
pub trait RequestLogger: Send + Sync {
    fn response(&self, entry: &ResponseLog<'_>);

    fn panic(&self, endpoint: &str, message: &str);
}

/// Logs through `tracing`, one `info` event per response.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl RequestLogger for TracingLogger {
    fn response(&self, entry: &ResponseLog<'_>) {
        let elapsed_ms = entry.elapsed.as_secs_f64() * 1000.0;
        tracing::info!(
            endpoint = entry.endpoint,
            status = entry.status.as_u16(),
            method = %entry.method,
            uri = %entry.uri,
            elapsed_ms,
            "{elapsed_ms:.3} ms -- {} -- {} {}",
            entry.status.as_u16(),
            entry.method,
            entry.uri,
        );
    }

    fn panic(&self, endpoint: &str, message: &str) {
        tracing::error!(endpoint, panic = message, "caught panic: {message}");
    }
}

// ─── Process-wide default ────────────────────────────────────────

static DEFAULT_LOGGER: Lazy<RwLock<Option<Arc<dyn RequestLogger>>>> =
    Lazy::new(|| RwLock::new(Some(Arc::new(TracingLogger))));

/// Logger picked up by handlers built without an explicit one.
pub fn default_logger() -> Option<Arc<dyn RequestLogger>> {
    DEFAULT_LOGGER.read().clone()
}

/// Replace the default logger; `None` disables request logging for handlers
/// built afterwards.
pub fn set_default_logger(logger: Option<Arc<dyn RequestLogger>>) {
    *DEFAULT_LOGGER.write() = logger;
}

/// Run a logging call, swallowing any panic it raises.
pub(crate) fn quietly<F: FnOnce()>(f: F) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!("request logger panicked; entry dropped");
    }
}
