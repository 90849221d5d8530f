//! Request body capture.
//!
//! The request body is drained into a pooled buffer before the inner service runs, then put
//! back into the request as a fresh body over the very same bytes. Handlers read exactly
//! what the client sent; the captured copy stays with the middleware until the request has
//! been logged.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request},
};
use bytes::BytesMut;
use http_body_util::BodyExt;
use std::{fmt::Display, net::SocketAddr, pin::pin};
use tracing::{debug, warn};

use crate::{
    config::LogOptions,
    content_type::{content_type_of, is_allowed},
    pool::BufferPool,
};

/// Error type for body capture operations
#[derive(Debug, thiserror::Error)]
pub enum BodyCaptureError {
    #[error("Body stream error: {0}")]
    StreamError(String),
}

/// A request body captured for logging.
#[derive(Debug, Clone)]
pub struct CapturedBody {
    /// The body bytes, shared with the body handed to the inner service
    pub data: Bytes,
    /// Normalized request content type (`type/subtype`)
    pub content_type: String,
}

impl CapturedBody {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Capture the request body if request body logging is on and its content type is allowed.
///
/// Returns the request to pass on and the captured body, if any. When nothing is captured
/// the request comes back untouched. A failure while reading the body is logged and the
/// bytes read so far are kept: the request always proceeds.
///
/// # Examples
///
/// ```rust
/// use axum::{body::Body, extract::Request};
/// use periscope::{body_wrapper::wrap_request_body, BufferPool, LogOptions};
///
/// # async fn example() {
/// let request = Request::builder()
///     .header("content-type", "application/json")
///     .body(Body::from(r#"{"id":1}"#))
///     .unwrap();
///
/// let options = LogOptions { reqbody: true, ..LogOptions::default() };
/// let (request, captured) = wrap_request_body(request, &options, &BufferPool::new()).await;
///
/// assert_eq!(captured.unwrap().data, r#"{"id":1}"#);
/// // `request` still carries the full body for the handler
/// # }
/// ```
pub async fn wrap_request_body(
    request: Request,
    options: &LogOptions,
    pool: &BufferPool,
) -> (Request, Option<CapturedBody>) {
    if !options.reqbody {
        return (request, None);
    }

    let content_type = content_type_of(request.headers());
    if !is_allowed(&content_type, &options.bodytypes) {
        debug!(content_type = %content_type, "Request body type not allowed, skipping capture");
        return (request, None);
    }

    let (parts, body) = request.into_parts();
    let mut buf = pool.acquire();
    if let Err(e) = drain_into(body, &mut buf).await {
        let remote_addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        warn!(
            raddr = ?remote_addr,
            method = %parts.method,
            path = %parts.uri,
            captured = buf.len(),
            error = %e,
            "Failed to read the request body"
        );
    }

    let data = buf.freeze();
    debug!(len = data.len(), content_type = %content_type, "Captured request body");

    let request = Request::from_parts(parts, Body::from(data.clone()));
    (request, Some(CapturedBody { data, content_type }))
}

/// Read every data frame of `body` into `buf`.
///
/// Frames are copied as they arrive, so only the frame in flight is held besides `buf`.
/// Bytes received before an error stay in `buf`. Trailers are not kept.
pub async fn drain_into<B>(body: B, buf: &mut BytesMut) -> Result<(), BodyCaptureError>
where
    B: http_body::Body<Data = Bytes>,
    B::Error: Display,
{
    let mut body = pin!(body);
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| BodyCaptureError::StreamError(e.to_string()))?;
        if let Some(data) = frame.data_ref() {
            buf.extend_from_slice(data);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn json_request(body: Body) -> Request {
        Request::builder()
            .method("POST")
            .uri("/items?x=1")
            .header("content-type", "application/json; charset=utf-8")
            .body(body)
            .unwrap()
    }

    fn capture_options() -> LogOptions {
        LogOptions {
            reqbody: true,
            ..LogOptions::default()
        }
    }

    async fn read_body(request: Request) -> Bytes {
        request.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_captured_body_is_replayed() {
        let pool = BufferPool::new();
        let payload = format!(r#"{{"data":"{}"}}"#, "x".repeat(3000));
        let (request, captured) =
            wrap_request_body(json_request(Body::from(payload.clone())), &capture_options(), &pool)
                .await;

        let captured = captured.expect("body should be captured");
        assert_eq!(captured.data, payload);
        assert_eq!(captured.content_type, "application/json");
        assert_eq!(captured.len(), payload.len());

        assert_eq!(read_body(request).await, payload);
    }

    #[tokio::test]
    async fn test_streamed_body_is_replayed() {
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from("{\"a\":")),
            Ok(Bytes::from("1}")),
        ];
        let body = Body::from_stream(stream::iter(chunks));
        let (request, captured) =
            wrap_request_body(json_request(body), &capture_options(), &BufferPool::new()).await;

        assert_eq!(captured.unwrap().data, "{\"a\":1}");
        assert_eq!(read_body(request).await, "{\"a\":1}");
    }

    #[tokio::test]
    async fn test_disabled_capture_leaves_request_untouched() {
        let pool = BufferPool::new();
        let (request, captured) = wrap_request_body(
            json_request(Body::from("{}")),
            &LogOptions::default(),
            &pool,
        )
        .await;

        assert!(captured.is_none());
        assert_eq!(read_body(request).await, "{}");
    }

    #[tokio::test]
    async fn test_disallowed_type_is_not_buffered() {
        let request = Request::builder()
            .header("content-type", "image/png")
            .body(Body::from("binary"))
            .unwrap();
        let (request, captured) =
            wrap_request_body(request, &capture_options(), &BufferPool::new()).await;

        assert!(captured.is_none());
        assert_eq!(read_body(request).await, "binary");
    }

    #[tokio::test]
    async fn test_read_error_keeps_partial_body() {
        let chunks = vec![
            Ok(Bytes::from("{\"partial\"")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ];
        let body = Body::from_stream(stream::iter(chunks));
        let (request, captured) =
            wrap_request_body(json_request(body), &capture_options(), &BufferPool::new()).await;

        assert_eq!(captured.unwrap().data, "{\"partial\"");
        assert_eq!(read_body(request).await, "{\"partial\"");
    }

    #[tokio::test]
    async fn test_drain_into_reports_errors() {
        let chunks = vec![
            Ok(Bytes::from("abc")),
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom")),
        ];
        let mut buf = BytesMut::new();
        let err = drain_into(Body::from_stream(stream::iter(chunks)), &mut buf)
            .await
            .unwrap_err();

        assert!(matches!(err, BodyCaptureError::StreamError(_)));
        assert_eq!(&buf[..], b"abc");
    }
}
