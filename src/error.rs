use std::time::Duration;

use thiserror::Error;

/// Shared result type.
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Everything that can go wrong while configuring counters or handlers.
///
/// All of these surface at construction time. Request-time failures are
/// recovered inside the handler wrapper and never become a `MetricsError`.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("granularity must be at least 1, got {0}")]
    InvalidGranularity(usize),

    #[error("window {window:?} cannot be split into {granularity} buckets")]
    InvalidWindow { window: Duration, granularity: usize },

    #[error("a counter set named '{0}' is already registered")]
    DuplicateName(String),

    #[error("invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("config: {0}")]
    Config(String),
}
