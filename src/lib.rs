//! # Periscope
//!
//! An Axum middleware that selectively captures request and response metadata (query
//! string, headers and bodies) and hands it, as key-value attributes, to a background
//! handler for logging.
//!
//! ## Features
//!
//! - **Transparent**: handlers read the exact request body the client sent, and clients
//!   receive the exact response body the handler produced
//! - **Filtered**: bodies are only captured for allowed content types and logged only
//!   under a size cap; whole paths can be excluded
//! - **Live configuration**: every decision polls a [`ConfigProvider`], so switches can be
//!   flipped at runtime through [`ReloadableConfig`]
//! - **Pooled buffers**: captured bodies live in buffers borrowed from a [`BufferPool`]
//! - **Background processing**: records are processed off the request path by a
//!   [`LogHandler`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use axum::{routing::post, Router};
//! use periscope::{LogOptions, LoggingHandler, RequestLoggerLayer, StaticConfig};
//!
//! async fn echo(body: String) -> String {
//!     body
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let options = LogOptions {
//!         query: true,
//!         reqbody: true,
//!         respbody: true,
//!         ..LogOptions::default()
//!     };
//!     let layer = RequestLoggerLayer::new(StaticConfig::new(options), LoggingHandler);
//!     layer.exclusions().register("/health");
//!
//!     let app = Router::new().route("/echo", post(echo)).layer(layer);
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```
//!
//! ## Opting out of response capture
//!
//! A handler that streams something nobody wants in the logs returns the
//! [`SkipResponseBody`] marker as a response extension:
//!
//! ```rust
//! use axum::Extension;
//! use periscope::SkipResponseBody;
//!
//! async fn export() -> (Extension<SkipResponseBody>, String) {
//!     (Extension(SkipResponseBody), "id,name\n1,widget\n".to_string())
//! }
//! ```

use axum::{body::Body, extract::Request, response::Response};
use std::{
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::{Duration, Instant, SystemTime},
};
use tokio::sync::mpsc;
use tower::{Layer, Service};
use tracing::{debug, error, instrument};

pub mod body_wrapper;
use body_wrapper::{wrap_request_body, CapturedBody};

pub mod collector;
pub use collector::{Attr, AttrValue, Collector, RequestSnapshot, ResponseView};

pub mod config;
pub use config::{ConfigError, ConfigProvider, LogOptions, ReloadableConfig, StaticConfig};

pub mod content_type;

pub mod exclusion;
pub use exclusion::ExclusionPolicy;

pub mod mirror;
use mirror::{is_skipped, MirrorBody};
pub use mirror::{skip_response_body, SkipResponseBody};

pub mod pool;
pub use pool::BufferPool;

pub mod types;
pub use types::LogRecord;

pub mod logging_handler;
pub use logging_handler::LoggingHandler;

/// Global atomic counter for request IDs and process start timestamp
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);
static PROCESS_START_TIME: std::sync::OnceLock<u64> = std::sync::OnceLock::new();

/// Generate a unique request ID combining process start time and counter
fn generate_request_id() -> u64 {
    let start_time = *PROCESS_START_TIME.get_or_init(|| {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    });

    let counter = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);

    // High 32 bits: process start timestamp, Low 32 bits: counter
    (start_time << 32) | (counter & 0xFFFFFFFF)
}

/// Trait for handling log records produced by the middleware.
///
/// Handlers run on a background task, so slow sinks never hold up responses.
///
/// # Examples
///
/// ```rust
/// use periscope::{LogHandler, LogRecord};
/// use tracing::info;
///
/// #[derive(Debug)]
/// struct MyHandler;
///
/// impl LogHandler for MyHandler {
///     async fn handle_record(&self, record: LogRecord) {
///         info!("{} {} -> {} with {} attributes",
///               record.method, record.uri, record.status, record.attrs.len());
///     }
/// }
/// ```
pub trait LogHandler: Send + Sync + 'static {
    /// Handle one completed request.
    ///
    /// # Arguments
    ///
    /// * `record` - Request and response metadata plus the collected attributes
    fn handle_record(&self, record: LogRecord) -> impl std::future::Future<Output = ()> + Send;
}

type EnabledFn = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Tower layer for the request logging middleware.
///
/// The layer spawns a background task that feeds every [`LogRecord`] to the provided
/// [`LogHandler`]. It must therefore be created inside a Tokio runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use periscope::{LoggingHandler, ReloadableConfig, RequestLoggerLayer};
/// use axum::{routing::get, Router};
/// use std::sync::Arc;
///
/// # async fn hello() -> &'static str { "Hello" }
/// # #[tokio::main]
/// # async fn main() {
/// let config = Arc::new(ReloadableConfig::default());
/// let layer = RequestLoggerLayer::new(config.clone(), LoggingHandler);
///
/// let app: Router = Router::new().route("/hello", get(hello)).layer(layer);
///
/// // Later, from an admin endpoint or a file watcher:
/// config.update(|options| options.respbody = true);
/// # }
/// ```
#[derive(Clone)]
pub struct RequestLoggerLayer {
    config: Arc<dyn ConfigProvider>,
    exclusions: Arc<ExclusionPolicy>,
    pool: Arc<BufferPool>,
    enabled: Option<EnabledFn>,
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl RequestLoggerLayer {
    /// Create a new request logger layer reading its switches from `config`.
    ///
    /// This spawns a background task that will process log records using the provided
    /// handler.
    ///
    /// # Arguments
    ///
    /// * `config` - Source of the current [`LogOptions`], polled on every request
    /// * `handler` - Implementation of [`LogHandler`] to process the records
    pub fn new<C: ConfigProvider, H: LogHandler>(config: C, handler: H) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
        let handler = Arc::new(handler);

        // Spawn the background task
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                handler.handle_record(record).await;
            }
        });

        Self {
            config: Arc::new(config),
            exclusions: Arc::new(ExclusionPolicy::new()),
            pool: Arc::new(BufferPool::new()),
            enabled: None,
            tx,
        }
    }

    /// Use a shared exclusion policy instead of a fresh one.
    pub fn with_exclusions(mut self, exclusions: Arc<ExclusionPolicy>) -> Self {
        self.exclusions = exclusions;
        self
    }

    /// Use a shared buffer pool instead of a fresh one.
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Narrow the eligibility check. A request is logged only when its path is not excluded
    /// by the [`ExclusionPolicy`] and `f` returns `true`.
    pub fn enabled_when<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        self.enabled = Some(Arc::new(f));
        self
    }

    /// The exclusion policy used by this layer; register paths on it at any time.
    pub fn exclusions(&self) -> &Arc<ExclusionPolicy> {
        &self.exclusions
    }
}

impl<S> Layer<S> for RequestLoggerLayer {
    type Service = RequestLoggerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        let collector = Collector::new(self.config.clone(), self.exclusions.clone());
        RequestLoggerService {
            inner,
            shared: Arc::new(Shared {
                config: self.config.clone(),
                exclusions: self.exclusions.clone(),
                pool: self.pool.clone(),
                enabled: self.enabled.clone(),
                collector,
                tx: self.tx.clone(),
            }),
        }
    }
}

struct Shared {
    config: Arc<dyn ConfigProvider>,
    exclusions: Arc<ExclusionPolicy>,
    pool: Arc<BufferPool>,
    enabled: Option<EnabledFn>,
    collector: Collector,
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl Shared {
    /// Excluded paths are never eligible, whatever the predicate says.
    fn is_enabled(&self, request: &Request) -> bool {
        if self.exclusions.is_excluded(request.uri().path()) {
            return false;
        }
        match &self.enabled {
            Some(enabled) => enabled(request),
            None => true,
        }
    }
}

/// Tower service implementation for the request logging middleware.
///
/// For each eligible request it captures the request body (if enabled), runs the inner
/// service, mirrors the response body (if enabled and not skipped), and once the response
/// has been fully sent collects the attributes and releases the buffers.
///
/// Users typically don't interact with this type directly - it's created by
/// [`RequestLoggerLayer`].
#[derive(Clone)]
pub struct RequestLoggerService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> Service<Request> for RequestLoggerService<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    #[instrument(skip_all)]
    fn call(&mut self, request: Request) -> Self::Future {
        if !self.shared.is_enabled(&request) {
            debug!(path = %request.uri().path(), "Request not eligible for logging");
            return Box::pin(self.inner.call(request));
        }

        // The request body is read before the inner service runs, so call a clone and
        // keep the service that was driven to readiness for it.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            let started = Instant::now();
            let timestamp = SystemTime::now();
            let request_id = generate_request_id();
            let snapshot = RequestSnapshot::from_request(&request);
            let skip_from_request = is_skipped(request.extensions());

            debug!(request_id = %request_id, method = %snapshot.method, uri = %snapshot.uri, "Starting request capture");

            let options = shared.config.current();
            let (request, request_body) = wrap_request_body(request, &options, &shared.pool).await;
            let scope = RequestScope {
                pool: shared.pool.clone(),
                body: request_body,
            };

            let response = inner.call(request).await?;
            let duration_to_first_byte = started.elapsed();

            let capture_response = shared.config.current().respbody
                && !skip_from_request
                && !is_skipped(response.extensions());

            let pending = PendingRecord {
                shared: shared.clone(),
                request_id,
                timestamp,
                started,
                duration_to_first_byte,
                snapshot,
                scope,
                status: response.status(),
                headers: response.headers().clone(),
            };

            if !capture_response {
                pending.finish(None);
                return Ok(response);
            }

            debug!(request_id = %request_id, "Wrapping response body for capture");
            let (parts, body) = response.into_parts();
            let body = MirrorBody::new(body, shared.pool.clone())
                .on_complete(move |mirrored| pending.finish(Some(mirrored)));

            Ok(Response::from_parts(parts, Body::new(body)))
        })
    }
}

/// Per-request captured state. Returns the request body buffer to the pool when dropped,
/// which happens after collection or on any early exit.
struct RequestScope {
    pool: Arc<BufferPool>,
    body: Option<CapturedBody>,
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        if let Some(body) = self.body.take() {
            self.pool.release_bytes(body.data);
        }
    }
}

/// Everything needed to build the record once the response is done.
struct PendingRecord {
    shared: Arc<Shared>,
    request_id: u64,
    timestamp: SystemTime,
    started: Instant,
    duration_to_first_byte: Duration,
    snapshot: RequestSnapshot,
    scope: RequestScope,
    status: axum::http::StatusCode,
    headers: axum::http::HeaderMap,
}

impl PendingRecord {
    fn finish(self, response_body: Option<&[u8]>) {
        let view = ResponseView {
            status: self.status,
            headers: &self.headers,
            body: response_body,
        };
        let attrs = self
            .shared
            .collector
            .collect_vec(&self.snapshot, self.scope.body.as_ref(), &view);
        drop(self.scope);

        let record = LogRecord {
            request_id: self.request_id,
            timestamp: self.timestamp,
            method: self.snapshot.method,
            uri: self.snapshot.uri,
            remote_addr: self.snapshot.remote_addr,
            status: self.status,
            duration_to_first_byte: self.duration_to_first_byte,
            duration: match response_body {
                Some(_) => self.started.elapsed(),
                None => self.duration_to_first_byte,
            },
            attrs,
        };

        if self.shared.tx.send(record).is_err() {
            error!(request_id = %self.request_id, "Failed to send log record to background task");
        }
    }
}
