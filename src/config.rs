use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MetricsError, Result};
use crate::metrics::rate_counter::{self, DEFAULT_GRANULARITY};
use crate::middleware::log::{self, TracingLogger};

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "ENDPOINT_STATS_CONFIG";

// ─── Types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the demo server binds to
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Buckets per rate window, for every counter not configured otherwise
    #[serde(default = "default_granularity")]
    pub granularity: usize,

    /// Emit one log line per request
    #[serde(default = "default_log_requests")]
    pub log_requests: bool,

    /// How often `/debug/vars/stream` pushes a snapshot
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub name: String,

    /// Window label → duration, e.g. `{"min": "1m", "sec": "1s"}`
    #[serde(default = "default_windows")]
    pub windows: BTreeMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:3000".into()
}
fn default_granularity() -> usize {
    DEFAULT_GRANULARITY
}
fn default_log_requests() -> bool {
    true
}
fn default_poll_interval() -> String {
    "1s".into()
}
fn default_windows() -> BTreeMap<String, String> {
    BTreeMap::from([("min".to_owned(), "1m".to_owned())])
}

// ─── Loading ─────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            granularity: default_granularity(),
            log_requests: default_log_requests(),
            poll_interval: default_poll_interval(),
            endpoints: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Config =
            serde_json::from_str(text).map_err(|e| MetricsError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| MetricsError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    /// File named by `ENDPOINT_STATS_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Reject anything that would otherwise fail on the first request.
    pub fn validate(&self) -> Result<()> {
        rate_counter::validate(Duration::from_secs(1), self.granularity)
            .map_err(|_| MetricsError::InvalidGranularity(self.granularity))?;
        parse_duration(&self.poll_interval)?;
        for ep in &self.endpoints {
            for window in ep.window_durations()?.values() {
                rate_counter::validate(*window, self.granularity)?;
            }
        }
        Ok(())
    }

    /// Install the process-wide granularity and default request logger.
    pub fn apply_globals(&self) -> Result<()> {
        rate_counter::set_default_granularity(self.granularity)?;
        if self.log_requests {
            log::set_default_logger(Some(Arc::new(TracingLogger)));
        } else {
            log::set_default_logger(None);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval)
    }

    /// Windows configured for `name`, or `None` to keep the handler default.
    pub fn windows_for(&self, name: &str) -> Result<Option<BTreeMap<String, Duration>>> {
        self.endpoints
            .iter()
            .find(|ep| ep.name == name)
            .map(EndpointConfig::window_durations)
            .transpose()
    }
}

impl EndpointConfig {
    pub fn window_durations(&self) -> Result<BTreeMap<String, Duration>> {
        self.windows
            .iter()
            .map(|(label, text)| Ok((label.clone(), parse_duration(text)?)))
            .collect()
    }
}

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"` or a bare number of seconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || MetricsError::InvalidDuration(text.to_owned());
    let trimmed = text.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid())?;

    let duration = match unit.trim() {
        "ns" => Duration::from_nanos(n),
        "us" | "µs" => Duration::from_micros(n),
        "ms" => Duration::from_millis(n),
        "" | "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.checked_mul(60).ok_or_else(invalid)?),
        "h" => Duration::from_secs(n.checked_mul(3_600).ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };
    if duration.is_zero() {
        return Err(invalid());
    }
    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration(" 1h ").unwrap(), Duration::from_secs(3_600));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("10 days").is_err());
    }

    #[test]
    fn defaults_when_fields_missing() {
        let cfg = Config::from_json(r#"{ "endpoints": [ { "name": "hello" } ] }"#).unwrap();
        assert_eq!(cfg.granularity, 32);
        assert!(cfg.log_requests);
        assert_eq!(cfg.poll_interval().unwrap(), Duration::from_secs(1));

        let windows = cfg.windows_for("hello").unwrap().unwrap();
        assert_eq!(windows["min"], Duration::from_secs(60));
        assert!(cfg.windows_for("other").unwrap().is_none());
    }

    #[test]
    fn rejects_windows_too_small_for_granularity() {
        let err = Config::from_json(
            r#"{ "granularity": 4, "endpoints": [ { "name": "x", "windows": { "tiny": "2ns" } } ] }"#,
        );
        assert!(matches!(err, Err(MetricsError::InvalidWindow { .. })));

        let err = Config::from_json(r#"{ "granularity": 0 }"#);
        assert!(matches!(err, Err(MetricsError::InvalidGranularity(0))));
    }

    #[test]
    fn unknown_fields_are_errors() {
        assert!(matches!(
            Config::from_json(r#"{ "granularty": 8 }"#),
            Err(MetricsError::Config(_))
        ));
    }
}
