//! Default handler writing records through `tracing`.
//!
//! This module provides [`LoggingHandler`], which emits one structured event per request
//! using the `tracing` crate. It serves as both a functional sink and an example of how to
//! implement [`LogHandler`].

use std::fmt;
use tracing::info;

use crate::{collector::Attr, LogHandler, LogRecord};

/// Simple logging implementation of [`LogHandler`].
///
/// Each record becomes a single `info` event carrying:
/// - Request ID
/// - HTTP method, URI and client address
/// - Status code, time to first byte and total duration
/// - The collected attributes (query, headers, bodies) as `key=value` pairs, with JSON
///   bodies written verbatim
///
/// # Examples
///
/// ```rust,no_run
/// use periscope::{LoggingHandler, RequestLoggerLayer, StaticConfig};
///
/// # #[tokio::main]
/// # async fn main() {
/// let layer = RequestLoggerLayer::new(StaticConfig::default(), LoggingHandler);
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct LoggingHandler;

impl LogHandler for LoggingHandler {
    async fn handle_record(&self, record: LogRecord) {
        info!(
            request_id = %record.request_id,
            raddr = ?record.remote_addr,
            method = %record.method,
            uri = %record.uri,
            status = record.status.as_u16(),
            ttfb_ms = record.duration_to_first_byte.as_millis(),
            duration_ms = record.duration.as_millis(),
            attrs = %Attrs(&record.attrs),
            "Request completed"
        );
    }
}

/// Space-separated `key=value` rendering.
struct Attrs<'a>(&'a [Attr]);

impl fmt::Display for Attrs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, attr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{attr}")?;
        }
        Ok(())
    }
}
