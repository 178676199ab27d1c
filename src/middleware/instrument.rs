//! Request/response accounting around a handler.
//!
//! ```ignore
//! async fn page(_req: Request, w: Sink) -> StatusCode {
//!     w.write_str("neat page");
//!     StatusCode::OK
//! }
//!
//! let page = InstrumentedHandler::builder("page", page).build(Registry::global())?;
//! let app = Router::new().route("/page", Arc::new(page).route());
//! ```
//!
//! Handlers that don't report their status can be adapted with
//! [`make_exp_handler`], at the cost of a sink wrapper per request.

use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Request,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, MethodRouter},
};
use futures::future::{BoxFuture, FutureExt};
use once_cell::sync::OnceCell;

use super::log::{self, RequestLogger, ResponseLog};
use crate::error::Result;
use crate::metrics::clock::{Clock, MonotonicClock};
use crate::metrics::rate_counter::{self, RateCounter};
use crate::metrics::registry::{CounterSet, Registry};
use crate::transport::{ResponseWriter, Sink, StatusRecorder};

// ─── Published keys ──────────────────────────────────────────────

pub const REQUESTS: &str = "requests";
pub const RESPONSES: &str = "responses";
pub const PANICS: &str = "panics";
pub const CANCELLED: &str = "cancelled";

/// Label and duration of the window every handler gets unless configured.
pub const DEFAULT_WINDOW: (&str, Duration) = ("min", Duration::from_secs(60));

const SERVER_ERROR_BODY: &str = "server error\n";

// ─── Handler shapes ──────────────────────────────────────────────

/// A handler that writes through a sink and returns its own status code.
///
/// Implemented for every `Fn(Request, Sink) -> impl Future<Output = StatusCode>`.
pub trait ExpHandler: Send + Sync + 'static {
    fn serve(&self, req: Request, w: Sink) -> BoxFuture<'static, StatusCode>;
}

impl<F, Fut> ExpHandler for F
where
    F: Fn(Request, Sink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StatusCode> + Send + 'static,
{
    fn serve(&self, req: Request, w: Sink) -> BoxFuture<'static, StatusCode> {
        (self)(req, w).boxed()
    }
}

/// A plain handler adapted to `ExpHandler`; see [`make_exp_handler`].
pub struct StatusCapture<F> {
    handler: F,
}

/// Adapt a handler that only writes to its sink. The reported status is the
/// first one it sets, or 500 if it never sets one.
pub fn make_exp_handler<F, Fut>(handler: F) -> StatusCapture<F>
where
    F: Fn(Request, Sink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    StatusCapture { handler }
}

impl<F, Fut> ExpHandler for StatusCapture<F>
where
    F: Fn(Request, Sink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve(&self, req: Request, w: Sink) -> BoxFuture<'static, StatusCode> {
        let recorder = Arc::new(StatusRecorder::new(w));
        let fut = (self.handler)(req, recorder.clone());
        async move {
            fut.await;
            recorder.status_or_default()
        }
        .boxed()
    }
}

// ─── Builder ─────────────────────────────────────────────────────

pub struct Builder<H> {
    name: String,
    handler: H,
    windows: Option<BTreeMap<String, Duration>>,
    granularity: Option<usize>,
    log: Option<Option<Arc<dyn RequestLogger>>>,
    clock: Arc<dyn Clock>,
}

impl<H: ExpHandler> Builder<H> {
    /// Add a rate window. The first call replaces the default `min` window.
    pub fn window(mut self, label: impl Into<String>, duration: Duration) -> Self {
        self.windows
            .get_or_insert_with(BTreeMap::new)
            .insert(label.into(), duration);
        self
    }

    /// Replace all rate windows.
    pub fn windows(mut self, windows: BTreeMap<String, Duration>) -> Self {
        self.windows = Some(windows);
        self
    }

    pub fn granularity(mut self, granularity: usize) -> Self {
        self.granularity = Some(granularity);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn RequestLogger>) -> Self {
        self.log = Some(Some(logger));
        self
    }

    pub fn without_logging(mut self) -> Self {
        self.log = Some(None);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the windows, publish the handler's counter set in `registry`
    /// and list its name in the discovery set.
    pub fn build(self, registry: &Registry) -> Result<InstrumentedHandler<H>> {
        let granularity = self
            .granularity
            .unwrap_or_else(rate_counter::default_granularity);
        let windows = self.windows.unwrap_or_else(|| {
            let (label, duration) = DEFAULT_WINDOW;
            BTreeMap::from([(label.to_owned(), duration)])
        });
        for duration in windows.values() {
            rate_counter::validate(*duration, granularity)?;
        }

        let stats = registry.new_named_set(&self.name)?;
        registry.discovery().add(&self.name, 1);

        Ok(InstrumentedHandler {
            name: self.name,
            stats,
            windows,
            granularity,
            handler: self.handler,
            log: self.log.unwrap_or_else(log::default_logger),
            clock: self.clock,
            counters: OnceCell::new(),
        })
    }
}

// ─── InstrumentedHandler ─────────────────────────────────────────

/// Wraps an [`ExpHandler`] and publishes request/response counts, per-status
/// counts and durations, and windowed request/response rates.
///
/// Each counter update is atomic on its own, but nothing spans several
/// counters: under concurrency `responses` may briefly disagree with the sum
/// of the `responses.<code>` entries.
pub struct InstrumentedHandler<H> {
    name: String,
    stats: Arc<CounterSet>,
    windows: BTreeMap<String, Duration>,
    granularity: usize,
    handler: H,
    log: Option<Arc<dyn RequestLogger>>,
    clock: Arc<dyn Clock>,
    counters: OnceCell<Counters>,
}

/// Allocated by the first request.
struct Counters {
    requests: Vec<Arc<RateCounter>>,
    responses: Vec<Arc<RateCounter>>,
}

impl<H: ExpHandler> InstrumentedHandler<H> {
    pub fn builder(name: impl Into<String>, handler: H) -> Builder<H> {
        Builder {
            name: name.into(),
            handler,
            windows: None,
            granularity: None,
            log: None,
            clock: Arc::new(MonotonicClock),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &Arc<CounterSet> {
        &self.stats
    }

    pub fn windows(&self) -> &BTreeMap<String, Duration> {
        &self.windows
    }

    /// Buckets per window for the counters built on the first request.
    pub fn granularity(&self) -> usize {
        self.granularity
    }

    pub fn logs_requests(&self) -> bool {
        self.log.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.counters.get().is_some()
    }

    /// Request-side rate counters, in window-label order. Empty until the
    /// first request.
    pub fn request_counters(&self) -> &[Arc<RateCounter>] {
        match self.counters.get() {
            Some(c) => &c.requests,
            None => &[],
        }
    }

    pub fn response_counters(&self) -> &[Arc<RateCounter>] {
        match self.counters.get() {
            Some(c) => &c.responses,
            None => &[],
        }
    }

    /// Run the wrapped handler for one request and account for it.
    ///
    /// A panic in the handler never escapes: it is logged, counted under
    /// `panics` and as a 500, and the caller gets a plain `500 server error`
    /// in place of anything the handler had written.
    pub async fn serve(&self, req: Request) -> Response {
        let counters = self.counters.get_or_init(|| self.init());

        self.stats.add(REQUESTS, 1);
        for rc in &counters.requests {
            rc.add(1);
        }

        let summary = self
            .log
            .as_ref()
            .map(|_| (req.method().clone(), req.uri().clone()));
        let writer = ResponseWriter::new();
        let sink: Sink = Arc::new(writer.clone());
        let mut guard = InFlight::new(&self.stats, &self.name);

        let start = self.clock.now();
        let handler = &self.handler;
        let outcome = AssertUnwindSafe(async move { handler.serve(req, sink).await })
            .catch_unwind()
            .await;
        let elapsed = self.clock.now().saturating_duration_since(start);
        guard.finish();

        match outcome {
            Ok(status) => {
                if let (Some(logger), Some((method, uri))) = (&self.log, &summary) {
                    let entry = ResponseLog {
                        endpoint: &self.name,
                        method,
                        uri,
                        status,
                        elapsed,
                    };
                    log::quietly(|| logger.response(&entry));
                }
                self.record_response(counters, status, elapsed);
                writer.into_response()
            }
            Err(payload) => {
                if let Some(logger) = &self.log {
                    let message = panic_message(&*payload);
                    log::quietly(|| logger.panic(&self.name, &message));
                }
                self.stats.add(PANICS, 1);
                self.record_response(counters, StatusCode::INTERNAL_SERVER_ERROR, elapsed);
                server_error()
            }
        }
    }

    /// axum route serving every method through this handler.
    pub fn route<S>(self: Arc<Self>) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        any(move |req: Request| async move { self.serve(req).await })
    }

    fn init(&self) -> Counters {
        let mut requests = Vec::with_capacity(self.windows.len());
        let mut responses = Vec::with_capacity(self.windows.len());

        for (label, window) in &self.windows {
            let req = Arc::new(RateCounter::validated(*window, self.granularity, self.clock.clone()));
            let resp = Arc::new(RateCounter::validated(*window, self.granularity, self.clock.clone()));
            self.stats.set(&format!("requests_per_{label}"), req.clone());
            self.stats.set(&format!("responses_per_{label}"), resp.clone());
            requests.push(req);
            responses.push(resp);
        }

        tracing::debug!(
            endpoint = %self.name,
            windows = self.windows.len(),
            granularity = self.granularity,
            "rate counters initialised"
        );
        Counters {
            requests,
            responses,
        }
    }

    fn record_response(&self, counters: &Counters, status: StatusCode, elapsed: Duration) {
        self.stats.add(RESPONSES, 1);
        for rc in &counters.responses {
            rc.add(1);
        }

        let elapsed_ns = i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX);
        let (count_key, total_key) = status_keys(status);
        self.stats.add(&count_key, 1);
        self.stats.add(&total_key, elapsed_ns);
    }
}

// ─── Helpers ─────────────────────────────────────────────────────

/// `responses.<code>` and `responses.<code>.total_ns`.
fn status_keys(status: StatusCode) -> (Cow<'static, str>, Cow<'static, str>) {
    match status {
        StatusCode::OK => ("responses.200".into(), "responses.200.total_ns".into()),
        StatusCode::BAD_REQUEST => ("responses.400".into(), "responses.400.total_ns".into()),
        StatusCode::UNAUTHORIZED => ("responses.401".into(), "responses.401.total_ns".into()),
        StatusCode::INTERNAL_SERVER_ERROR => {
            ("responses.500".into(), "responses.500.total_ns".into())
        }
        other => {
            let code = other.as_u16();
            (
                format!("responses.{code}").into(),
                format!("responses.{code}.total_ns").into(),
            )
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            (
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ),
        ],
        SERVER_ERROR_BODY,
    )
        .into_response()
}

/// Counts a request whose future was dropped before the handler finished.
/// Such requests get no response-side accounting.
struct InFlight<'a> {
    stats: &'a CounterSet,
    endpoint: &'a str,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(stats: &'a CounterSet, endpoint: &'a str) -> Self {
        Self {
            stats,
            endpoint,
            armed: true,
        }
    }

    fn finish(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.stats.add(CANCELLED, 1);
            tracing::debug!(endpoint = self.endpoint, "request dropped before the handler returned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::clock::ManualClock;
    use crate::transport::ResponseSink;
    use axum::body::{to_bytes, Body};
    use parking_lot::Mutex;

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_string(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn ok(_req: Request, w: Sink) -> StatusCode {
        w.write_str("neat page");
        StatusCode::OK
    }

    #[derive(Default)]
    struct Recording {
        lines: Mutex<Vec<String>>,
    }

    impl RequestLogger for Recording {
        fn response(&self, entry: &ResponseLog<'_>) {
            self.lines
                .lock()
                .push(format!("{} {} {}", entry.status.as_u16(), entry.method, entry.uri));
        }

        fn panic(&self, endpoint: &str, message: &str) {
            self.lines.lock().push(format!("panic {endpoint}: {message}"));
        }
    }

    struct Broken;

    impl RequestLogger for Broken {
        fn response(&self, _entry: &ResponseLog<'_>) {
            panic!("logger is broken");
        }

        fn panic(&self, _endpoint: &str, _message: &str) {
            panic!("logger is broken");
        }
    }

    #[tokio::test]
    async fn initialises_on_first_request_only() {
        let reg = Registry::new();
        let h = InstrumentedHandler::builder("page", ok)
            .without_logging()
            .build(&reg)
            .unwrap();

        assert!(!h.is_initialized());
        assert!(h.stats().get("requests_per_min").is_none());
        assert_eq!(reg.discovery().int("page"), Some(1));

        let resp = h.serve(get("/page")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_string(resp).await, "neat page");

        assert!(h.is_initialized());
        assert_eq!(h.request_counters().len(), 1);
        assert_eq!(h.request_counters()[0].window(), Duration::from_secs(60));
        assert_eq!(h.request_counters()[0].granularity(), rate_counter::default_granularity());
        assert_eq!(reg.snapshot()["page"]["requests_per_min"], 1);
        assert_eq!(reg.snapshot()["page"]["responses_per_min"], 1);
    }

    #[tokio::test]
    async fn records_elapsed_per_status() {
        let reg = Registry::new();
        let clock = Arc::new(ManualClock::new());
        let tick = clock.clone();
        let h = InstrumentedHandler::builder("slow", move |_req: Request, w: Sink| {
            tick.advance(Duration::from_millis(5));
            async move {
                w.write_header(StatusCode::ACCEPTED);
                StatusCode::ACCEPTED
            }
        })
        .clock(clock)
        .without_logging()
        .build(&reg)
        .unwrap();

        for _ in 0..3 {
            let resp = h.serve(get("/slow")).await;
            assert_eq!(resp.status(), StatusCode::ACCEPTED);
        }

        let stats = h.stats();
        assert_eq!(stats.int(REQUESTS), Some(3));
        assert_eq!(stats.int(RESPONSES), Some(3));
        assert_eq!(stats.int("responses.202"), Some(3));
        assert_eq!(stats.int("responses.202.total_ns"), Some(15_000_000));
    }

    #[tokio::test]
    async fn several_windows_get_their_own_counters() {
        let reg = Registry::new();
        let h = InstrumentedHandler::builder("multi", ok)
            .window("sec", Duration::from_secs(1))
            .window("hour", Duration::from_secs(3_600))
            .granularity(4)
            .without_logging()
            .build(&reg)
            .unwrap();

        h.serve(get("/")).await;
        h.serve(get("/")).await;

        let keys = h.stats().keys();
        for key in [
            "requests_per_sec",
            "responses_per_sec",
            "requests_per_hour",
            "responses_per_hour",
        ] {
            assert!(keys.iter().any(|k| k == key), "missing {key}");
        }
        assert!(!keys.iter().any(|k| k == "requests_per_min"));
        assert_eq!(h.response_counters().len(), 2);
        assert!(h.response_counters().iter().all(|rc| rc.value() == 2));
    }

    #[test]
    fn invalid_windows_fail_at_build() {
        let reg = Registry::new();
        let err = InstrumentedHandler::builder("bad", ok)
            .granularity(0)
            .build(&reg);
        assert!(err.is_err());

        let err = InstrumentedHandler::builder("bad", ok)
            .window("tiny", Duration::from_nanos(2))
            .granularity(4)
            .build(&reg);
        assert!(err.is_err());

        // nothing was published for the rejected configurations
        assert!(reg.get("bad").is_none());
    }

    #[test]
    fn names_are_unique_per_registry() {
        let reg = Registry::new();
        InstrumentedHandler::builder("dup", ok).build(&reg).unwrap();
        assert!(InstrumentedHandler::builder("dup", ok).build(&reg).is_err());
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn panic_becomes_generic_500() {
        let reg = Registry::new();
        let logger = Arc::new(Recording::default());
        let h = InstrumentedHandler::builder("boom", |_req: Request, w: Sink| async move {
            w.write_header(StatusCode::OK);
            w.write_str("half a pa");
            panic!("database went away");
            StatusCode::OK
        })
        .logger(logger.clone())
        .build(&reg)
        .unwrap();

        let resp = h.serve(get("/boom")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(resp.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(body_string(resp).await, "server error\n");

        let stats = h.stats();
        assert_eq!(stats.int(PANICS), Some(1));
        assert_eq!(stats.int("responses.500"), Some(1));
        assert_eq!(stats.int(RESPONSES), Some(1));
        assert_eq!(stats.int(CANCELLED), None);
        assert!(stats.int("responses.200").is_none());
        assert_eq!(*logger.lines.lock(), vec!["panic boom: database went away"]);
    }

    #[tokio::test]
    async fn panic_before_the_future_exists_is_caught() {
        let reg = Registry::new();
        let h = InstrumentedHandler::builder("eager", |_req: Request, _w: Sink| {
            if true {
                panic!("eager");
            }
            async { StatusCode::OK }
        })
        .without_logging()
        .build(&reg)
        .unwrap();

        let resp = h.serve(get("/")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(h.stats().int(PANICS), Some(1));
    }

    #[tokio::test]
    async fn broken_logger_does_not_break_responses() {
        let reg = Registry::new();
        let h = InstrumentedHandler::builder("noisy", ok)
            .logger(Arc::new(Broken))
            .build(&reg)
            .unwrap();

        let resp = h.serve(get("/")).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(h.stats().int("responses.200"), Some(1));
    }

    #[tokio::test]
    #[allow(unreachable_code)]
    async fn broken_logger_still_sends_generic_500() {
        let reg = Registry::new();
        let h = InstrumentedHandler::builder("noisy", |_req: Request, w: Sink| async move {
            w.write_str("partial");
            panic!("handler failed");
            StatusCode::OK
        })
        .logger(Arc::new(Broken))
        .build(&reg)
        .unwrap();

        let resp = h.serve(get("/")).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_string(resp).await, "server error\n");
        assert_eq!(h.stats().int(PANICS), Some(1));
        assert_eq!(h.stats().int("responses.500"), Some(1));
    }

    #[tokio::test]
    async fn logs_one_line_per_response() {
        let reg = Registry::new();
        let logger = Arc::new(Recording::default());
        let h = InstrumentedHandler::builder("logged", ok)
            .logger(logger.clone())
            .build(&reg)
            .unwrap();

        h.serve(get("/logged?x=1")).await;
        assert_eq!(*logger.lines.lock(), vec!["200 GET /logged?x=1"]);
    }

    #[tokio::test]
    async fn plain_handler_status_is_captured() {
        let reg = Registry::new();
        let h = InstrumentedHandler::builder(
            "plain",
            make_exp_handler(|req: Request, w: Sink| async move {
                if req.uri().path() == "/missing" {
                    w.write_header(StatusCode::NOT_FOUND);
                }
                w.write_str("body");
            }),
        )
        .without_logging()
        .build(&reg)
        .unwrap();

        let resp = h.serve(get("/missing")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        // never set a status: wire says 200, accounting says 500
        let resp = h.serve(get("/found")).await;
        assert_eq!(resp.status(), StatusCode::OK);

        assert_eq!(h.stats().int("responses.404"), Some(1));
        assert_eq!(h.stats().int("responses.500"), Some(1));
    }

    #[tokio::test]
    async fn dropped_request_counts_as_cancelled() {
        let reg = Registry::new();
        let h = InstrumentedHandler::builder("hang", |_req: Request, _w: Sink| async {
            futures::future::pending::<()>().await;
            StatusCode::OK
        })
        .without_logging()
        .build(&reg)
        .unwrap();

        let timed_out = tokio::time::timeout(Duration::from_millis(20), h.serve(get("/"))).await;
        assert!(timed_out.is_err());

        let stats = h.stats();
        assert_eq!(stats.int(REQUESTS), Some(1));
        assert_eq!(stats.int(CANCELLED), Some(1));
        assert_eq!(stats.int(RESPONSES), None);
    }

    #[test]
    fn well_known_and_generic_status_keys() {
        assert_eq!(status_keys(StatusCode::OK).0, "responses.200");
        assert_eq!(status_keys(StatusCode::UNAUTHORIZED).1, "responses.401.total_ns");
        let (count, total) = status_keys(StatusCode::IM_A_TEAPOT);
        assert_eq!(count, "responses.418");
        assert_eq!(total, "responses.418.total_ns");
    }
}
