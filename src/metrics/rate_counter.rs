use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::clock::{Clock, MonotonicClock};
use super::registry::Exportable;
use crate::error::{MetricsError, Result};

// ─── Configuration ───────────────────────────────────────────────

/// Default number of buckets a window is split into.
///
/// A one-minute window with 32 buckets is accurate to within ~1.9s, so a
/// poller should sample less often than `window / granularity`.
pub const DEFAULT_GRANULARITY: usize = 32;

static GRANULARITY: AtomicUsize = AtomicUsize::new(DEFAULT_GRANULARITY);

/// Process-wide granularity used by `RateCounter::new` and by handlers that
/// don't override it.
pub fn default_granularity() -> usize {
    GRANULARITY.load(Ordering::Relaxed)
}

/// Change the process-wide granularity. Counters already built keep theirs.
pub fn set_default_granularity(granularity: usize) -> Result<()> {
    if granularity == 0 {
        return Err(MetricsError::InvalidGranularity(granularity));
    }
    GRANULARITY.store(granularity, Ordering::Relaxed);
    Ok(())
}

/// Check that `window` can be split into `granularity` non-empty buckets.
pub fn validate(window: Duration, granularity: usize) -> Result<()> {
    if granularity == 0 {
        return Err(MetricsError::InvalidGranularity(granularity));
    }
    if window.as_nanos() / (granularity as u128) == 0 {
        return Err(MetricsError::InvalidWindow {
            window,
            granularity,
        });
    }
    Ok(())
}

// ─── Public types ────────────────────────────────────────────────

/// Approximate count of events over a trailing window.
///
/// The window is split into `granularity` buckets kept in a ring. Buckets
/// are rotated lazily by whichever `add` or `value` call first notices that
/// time has moved on; there is no background timer. The reported value lags
/// the true rate by at most one bucket duration.
pub struct RateCounter {
    window: Duration,
    bucket_nanos: u128,
    origin: Instant,
    clock: Arc<dyn Clock>,
    ring: Mutex<Ring>,
}

// ─── Internal state ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Time slot this bucket was claimed for, in bucket durations since
    /// `origin`.
    tick: u64,
    count: u64,
}

struct Ring {
    buckets: Vec<Bucket>,
    cursor: usize,
    /// Tick owned by `buckets[cursor]`.
    head: u64,
}

// ─── RateCounter impl ────────────────────────────────────────────

impl RateCounter {
    /// Counter over `window` using the process-wide default granularity.
    pub fn new(window: Duration) -> Result<Self> {
        Self::with_granularity(window, default_granularity())
    }

    pub fn with_granularity(window: Duration, granularity: usize) -> Result<Self> {
        Self::with_clock(window, granularity, Arc::new(MonotonicClock))
    }

    pub fn with_clock(
        window: Duration,
        granularity: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        validate(window, granularity)?;
        Ok(Self::validated(window, granularity, clock))
    }

    /// Build from a window and granularity that already passed `validate`.
    pub(crate) fn validated(window: Duration, granularity: usize, clock: Arc<dyn Clock>) -> Self {
        let granularity = granularity.max(1);
        let bucket_nanos = (window.as_nanos() / granularity as u128).max(1);
        let origin = clock.now();
        Self {
            window,
            bucket_nanos,
            origin,
            clock,
            ring: Mutex::new(Ring {
                buckets: vec![Bucket::default(); granularity],
                cursor: 0,
                head: 0,
            }),
        }
    }

    /// Record `delta` events at the current time.
    pub fn add(&self, delta: u64) {
        let tick = self.current_tick();
        let mut ring = self.ring.lock();
        ring.rotate(tick);
        let cursor = ring.cursor;
        let bucket = &mut ring.buckets[cursor];
        bucket.count = bucket.count.saturating_add(delta);
    }

    /// Events recorded within the last `window`.
    pub fn value(&self) -> u64 {
        let tick = self.current_tick();
        let mut ring = self.ring.lock();
        ring.rotate(tick);
        ring.live_sum()
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn granularity(&self) -> usize {
        self.ring.lock().buckets.len()
    }

    pub fn bucket_duration(&self) -> Duration {
        // bucket_nanos <= window.as_nanos(), which fits a Duration
        Duration::from_nanos(self.bucket_nanos as u64)
    }

    /// A clock reading earlier than `origin` maps to tick 0.
    fn current_tick(&self) -> u64 {
        let elapsed = self.clock.now().saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.bucket_nanos) as u64
    }
}

// ─── Ring impl ───────────────────────────────────────────────────

impl Ring {
    /// Advance the cursor to `tick`, zeroing every bucket it claims.
    ///
    /// Ticks at or before `head` (same slot, or a clock that went backward)
    /// leave the ring untouched. At most `buckets.len()` buckets are claimed,
    /// so an idle gap longer than the window clears the whole ring in one go.
    fn rotate(&mut self, tick: u64) {
        if tick <= self.head {
            return;
        }
        let len = self.buckets.len();
        let steps = (tick - self.head).min(len as u64);
        let first = tick - steps + 1;
        for i in 0..steps {
            self.cursor = (self.cursor + 1) % len;
            self.buckets[self.cursor] = Bucket {
                tick: first + i,
                count: 0,
            };
        }
        self.head = tick;
    }

    /// Sum of buckets within one window of `head`.
    fn live_sum(&self) -> u64 {
        let span = self.buckets.len() as u64;
        self.buckets
            .iter()
            .filter(|b| b.tick <= self.head && self.head - b.tick < span)
            .fold(0u64, |acc, b| acc.saturating_add(b.count))
    }
}

impl fmt::Display for RateCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

impl fmt::Debug for RateCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateCounter")
            .field("window", &self.window)
            .field("bucket_duration", &self.bucket_duration())
            .field("value", &self.value())
            .finish()
    }
}

impl Exportable for RateCounter {
    fn export(&self) -> serde_json::Value {
        serde_json::Value::from(self.value())
    }
}
