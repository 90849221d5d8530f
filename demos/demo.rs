use axum::{
    body::{Body, Bytes},
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use periscope::{
    LogHandler, LogOptions, LogRecord, LoggingHandler, ReloadableConfig, RequestLoggerLayer,
    SkipResponseBody,
};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{net::TcpListener, time::sleep};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Logs every record through [`LoggingHandler`] and keeps the most recent ones in memory
/// so they can be inspected over HTTP
#[derive(Debug, Clone, Default)]
struct RecentRecords {
    logger: LoggingHandler,
    records: Arc<Mutex<Vec<RecentRecord>>>,
}

#[derive(Debug, Clone, Serialize)]
struct RecentRecord {
    request_id: u64,
    method: String,
    uri: String,
    status: u16,
    duration_ms: u64,
    attrs: Vec<periscope::Attr>,
}

impl LogHandler for RecentRecords {
    async fn handle_record(&self, record: LogRecord) {
        self.logger.handle_record(record.clone()).await;

        let mut records = self.records.lock().unwrap();
        if records.len() == 50 {
            records.remove(0);
        }
        records.push(RecentRecord {
            request_id: record.request_id,
            method: record.method.to_string(),
            uri: record.uri.to_string(),
            status: record.status.as_u16(),
            duration_ms: record.duration.as_millis() as u64,
            attrs: record.attrs,
        });
    }
}

#[derive(Clone)]
struct AppState {
    recent: RecentRecords,
    config: Arc<ReloadableConfig>,
}

async fn hello_handler() -> impl IntoResponse {
    sleep(Duration::from_millis(100)).await; // Simulate some work
    "Hello, World!"
}

async fn echo_handler(Json(value): Json<serde_json::Value>) -> impl IntoResponse {
    sleep(Duration::from_millis(50)).await; // Simulate some work
    Json(serde_json::json!({ "echo": value }))
}

async fn streaming_handler() -> impl IntoResponse {
    use futures::stream;
    use tokio::time::interval;

    let stream = stream::unfold(0u32, |count| async move {
        if count >= 5 {
            None
        } else {
            let mut interval = interval(Duration::from_millis(200));
            interval.tick().await;
            Some((
                Ok::<_, std::convert::Infallible>(Bytes::from(format!("chunk-{count}\n"))),
                count + 1,
            ))
        }
    });

    Response::builder()
        .header("content-type", "text/plain")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn download_handler() -> impl IntoResponse {
    // Large payloads opt out of response body capture
    (Extension(SkipResponseBody), "x".repeat(64 * 1024))
}

async fn recent_handler(State(state): State<AppState>) -> impl IntoResponse {
    let records = state.recent.records.lock().unwrap().clone();
    Json(serde_json::json!({
        "total_records": records.len(),
        "records": records,
    }))
}

async fn options_handler(State(state): State<AppState>, body: String) -> impl IntoResponse {
    match state.config.reload_from_toml(&body) {
        Ok(()) => (StatusCode::OK, "reloaded\n".to_string()),
        Err(e) => (StatusCode::BAD_REQUEST, format!("{e}\n")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "demo=info,periscope=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting request capture demo server");

    let config = match std::env::args().nth(1) {
        Some(path) => Arc::new(ReloadableConfig::from_toml_file(path.as_ref())?),
        None => Arc::new(ReloadableConfig::new(LogOptions {
            bodytypes: vec!["application/json".to_string(), "text/*".to_string()],
            ..LogOptions::all()
        })),
    };

    let recent = RecentRecords::default();
    let layer = RequestLoggerLayer::new(config.clone(), recent.clone());
    layer.exclusions().register("/health");
    layer.exclusions().register("/admin/");

    let state = AppState { recent, config };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/hello", get(hello_handler))
        .route("/echo", post(echo_handler))
        .route("/streaming", get(streaming_handler))
        .route("/download", get(download_handler))
        .route("/admin/recent", get(recent_handler))
        .route("/admin/options", post(options_handler))
        .with_state(state)
        .layer(layer)
        .layer(TraceLayer::new_for_http());

    info!("Demo server endpoints:");
    info!("  GET  /hello          - Simple greeting");
    info!("  POST /echo           - Echo a JSON body");
    info!("  GET  /streaming      - Streaming response");
    info!("  GET  /download       - Large response, not captured");
    info!("  GET  /admin/recent   - Recently logged requests (not logged itself)");
    info!("  POST /admin/options  - Reload the [log] options from a TOML body");
    info!("");
    info!("Try these commands:");
    info!("  curl 'http://localhost:3000/hello?name=demo'");
    info!("  curl -X POST -H 'content-type: application/json' -d '{{\"a\":1}}' http://localhost:3000/echo");
    info!("  curl http://localhost:3000/streaming");
    info!("  curl --data-binary $'[log]\\nrespbody = false' http://localhost:3000/admin/options");
    info!("  curl http://localhost:3000/admin/recent");

    let listener = TcpListener::bind("0.0.0.0:3000").await?;
    info!("Demo server listening on http://localhost:3000");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
