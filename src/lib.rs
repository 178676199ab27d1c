//! Request/response throughput and latency accounting for HTTP endpoints.
//!
//! Wrap a handler in an [`InstrumentedHandler`] and it publishes, under its
//! name in a [`Registry`], request and response totals, per-status counts
//! and cumulative durations, and sliding-window rates backed by
//! [`RateCounter`]s. Pollers read everything through the registry snapshot.

use std::time::Duration;

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod server;
pub mod transport;

pub use error::{MetricsError, Result};
pub use metrics::{RateCounter, Registry};
pub use middleware::instrument::{make_exp_handler, ExpHandler, InstrumentedHandler};
pub use transport::{ResponseSink, ResponseWriter, Sink, StatusRecorder};

/// Shared application state available to the polling routes via
/// `State<Arc<AppState>>`.
pub struct AppState {
    /// Where instrumented handlers publish and pollers read.
    pub registry: &'static Registry,

    /// Tick of the SSE snapshot stream.
    pub poll_interval: Duration,
}
