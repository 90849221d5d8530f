//! Response body mirroring.
//!
//! [`MirrorBody`] sits between the inner service's response body and the connection. Every
//! data frame is handed on unchanged and a copy of its bytes is appended to a pooled
//! buffer. When the body finishes (or is dropped early, e.g. on client disconnect) the
//! completion callback sees everything that was sent and the buffer goes back to the pool.

use axum::{
    body::{Body, Bytes},
    http::Extensions,
};
use bytes::BytesMut;
use http_body::{Frame, SizeHint};
use std::{
    any::Any,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use crate::pool::BufferPool;

type OnComplete = Box<dyn FnOnce(&[u8]) + Send>;

/// Marker that turns off response body capture for one request.
///
/// A handler opts out by adding it to its response, an outer layer by adding it to the
/// request extensions. It is checked once, right before the response body would be wrapped.
///
/// ```rust
/// use axum::Extension;
/// use periscope::SkipResponseBody;
///
/// async fn download() -> (Extension<SkipResponseBody>, &'static str) {
///     (Extension(SkipResponseBody), "large payload nobody wants in the logs")
/// }
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipResponseBody;

/// Mark a request or response as opted out of response body capture.
pub fn skip_response_body(extensions: &mut Extensions) {
    extensions.insert(SkipResponseBody);
}

pub(crate) fn is_skipped(extensions: &Extensions) -> bool {
    extensions.get::<SkipResponseBody>().is_some()
}

/// A body decorator that records the bytes it passes through.
///
/// Trailers, errors, [`is_end_stream`](http_body::Body::is_end_stream) and
/// [`size_hint`](http_body::Body::size_hint) all come straight from the inner body, so code
/// downstream cannot tell the difference.
pub struct MirrorBody<B> {
    inner: B,
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
    on_complete: Option<OnComplete>,
}

impl<B> MirrorBody<B> {
    /// Wrap `inner`, mirroring into a buffer taken from `pool`.
    pub fn new(inner: B, pool: Arc<BufferPool>) -> Self {
        Self {
            inner,
            buf: Some(pool.acquire()),
            pool,
            on_complete: None,
        }
    }

    /// Set the callback run once with the mirrored bytes when the body completes or drops.
    pub fn on_complete<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&[u8]) + Send + 'static,
    {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Bytes mirrored so far. Empty once the body has completed.
    pub fn mirrored(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }

    pub fn get_ref(&self) -> &B {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    fn finish(&mut self) {
        let Some(buf) = self.buf.take() else {
            return;
        };
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&buf[..]);
        }
        self.pool.release(buf);
    }
}

impl<B> Drop for MirrorBody<B> {
    fn drop(&mut self) {
        self.finish();
    }
}

impl<B> http_body::Body for MirrorBody<B>
where
    B: http_body::Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let (Some(data), Some(buf)) = (frame.data_ref(), this.buf.as_mut()) {
                    buf.extend_from_slice(data);
                }
            }
            Poll::Ready(None) => this.finish(),
            Poll::Ready(Some(Err(_))) | Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Capability implemented by body decorators to expose what they wrap.
///
/// Code looking for a particular layer in a stack of decorators calls
/// [`find_layer`] instead of knowing the exact nesting.
///
/// The chain is only walkable while the decorators keep their concrete types. Once a stack
/// is boxed into an [`axum::body::Body`] (as [`RequestLoggerLayer`](crate::RequestLoggerLayer)
/// does with its responses) the boxed body is a leaf and the layers inside it are hidden.
pub trait Unwrap: Any {
    /// The wrapped value, or `None` for the innermost layer.
    fn unwrap_layer(&self) -> Option<&dyn Unwrap>;

    fn as_any(&self) -> &dyn Any;
}

impl Unwrap for Body {
    fn unwrap_layer(&self) -> Option<&dyn Unwrap> {
        None
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<B: Unwrap> Unwrap for MirrorBody<B> {
    fn unwrap_layer(&self) -> Option<&dyn Unwrap> {
        Some(&self.inner)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Walk a decorator chain from the outside in, returning the first layer of type `T`.
///
/// ```rust
/// use axum::body::Body;
/// use periscope::{mirror::{find_layer, MirrorBody}, BufferPool};
/// use std::sync::Arc;
///
/// let body = MirrorBody::new(Body::from("hi"), Arc::new(BufferPool::new()));
/// assert!(find_layer::<MirrorBody<Body>>(&body).is_some());
/// assert!(find_layer::<Body>(&body).is_some());
/// ```
pub fn find_layer<T: Unwrap>(mut layer: &dyn Unwrap) -> Option<&T> {
    loop {
        if let Some(found) = layer.as_any().downcast_ref::<T>() {
            return Some(found);
        }
        layer = layer.unwrap_layer()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http_body::Body as _;
    use http_body_util::BodyExt;
    use std::sync::Mutex;

    fn captured_sink() -> (Arc<Mutex<Option<Vec<u8>>>>, impl FnOnce(&[u8]) + Send + 'static) {
        let sink = Arc::new(Mutex::new(None));
        let writer = sink.clone();
        (sink, move |bytes: &[u8]| {
            *writer.lock().unwrap() = Some(bytes.to_vec());
        })
    }

    #[tokio::test]
    async fn test_mirrors_every_chunk() {
        let pool = Arc::new(BufferPool::new());
        let (sink, on_complete) = captured_sink();
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from("chunk1")),
            Ok(Bytes::from("chunk2")),
            Ok(Bytes::from("chunk3")),
        ];
        let body = MirrorBody::new(Body::from_stream(stream::iter(chunks)), pool.clone())
            .on_complete(on_complete);

        let delivered = body.collect().await.unwrap().to_bytes();

        assert_eq!(delivered, "chunk1chunk2chunk3");
        assert_eq!(
            sink.lock().unwrap().as_deref(),
            Some(&b"chunk1chunk2chunk3"[..])
        );
        assert_eq!(pool.idle(), 1);
        assert!(pool.acquire().is_empty());
    }

    #[tokio::test]
    async fn test_mirrored_bytes_track_delivered_bytes() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let chunks: Vec<Result<Bytes, std::io::Error>> = data
            .chunks(333)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut body = MirrorBody::new(
            Body::from_stream(stream::iter(chunks)),
            Arc::new(BufferPool::new()),
        );

        let mut delivered = Vec::new();
        while let Some(frame) = body.frame().await {
            let frame = frame.unwrap();
            delivered.extend_from_slice(frame.data_ref().unwrap());
            assert_eq!(body.mirrored(), &delivered[..]);
        }

        assert_eq!(delivered, data);
    }

    #[tokio::test]
    async fn test_drop_before_end_still_completes_once() {
        let pool = Arc::new(BufferPool::new());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let chunks = vec![
            Ok::<_, std::io::Error>(Bytes::from("first")),
            Ok(Bytes::from("second")),
        ];
        let mut body = MirrorBody::new(Body::from_stream(stream::iter(chunks)), pool.clone())
            .on_complete(move |bytes| {
                assert_eq!(bytes, b"first");
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });

        let _ = body.frame().await.unwrap().unwrap();
        drop(body);

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_delegates_end_of_stream_and_size_hint() {
        let body = MirrorBody::new(Body::from("12345"), Arc::new(BufferPool::new()));
        assert_eq!(body.size_hint().exact(), Some(5));
        assert!(!body.is_end_stream());

        let empty = MirrorBody::new(Body::empty(), Arc::new(BufferPool::new()));
        assert!(empty.is_end_stream());
        assert_eq!(empty.size_hint().exact(), Some(0));
    }

    #[test]
    fn test_find_layer_walks_nested_decorators() {
        let pool = Arc::new(BufferPool::new());
        let inner = MirrorBody::new(Body::from("x"), pool.clone());
        let outer = MirrorBody::new(inner, pool);

        assert!(find_layer::<MirrorBody<MirrorBody<Body>>>(&outer).is_some());
        assert!(find_layer::<MirrorBody<Body>>(&outer).is_some());
        assert!(find_layer::<Body>(&outer).is_some());
        assert!(find_layer::<MirrorBody<Body>>(outer.get_ref().get_ref()).is_none());
    }

    #[test]
    fn test_boxed_stack_is_a_leaf() {
        let mirrored = MirrorBody::new(Body::from("x"), Arc::new(BufferPool::new()));
        let boxed = Body::new(mirrored);

        assert!(find_layer::<Body>(&boxed).is_some());
        assert!(find_layer::<MirrorBody<Body>>(&boxed).is_none());
    }

    #[test]
    fn test_skip_marker() {
        let mut extensions = Extensions::new();
        assert!(!is_skipped(&extensions));
        skip_response_body(&mut extensions);
        assert!(is_skipped(&extensions));
    }
}
