//! The log record handed to [`LogHandler`](crate::LogHandler)s.

use axum::http::{Method, StatusCode, Uri};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use crate::collector::{Attr, AttrValue};

/// One logged request.
///
/// The fixed fields describe the exchange; `attrs` holds whatever the collector emitted
/// under the current configuration (query, headers, bodies).
///
/// # Examples
///
/// ```rust
/// use periscope::{LogHandler, LogRecord};
///
/// struct StatusCounter;
///
/// impl LogHandler for StatusCounter {
///     async fn handle_record(&self, record: LogRecord) {
///         if record.status.is_server_error() {
///             eprintln!("{} {} failed", record.method, record.uri);
///         }
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LogRecord {
    /// Unique identifier for this request within the process
    pub request_id: u64,
    /// When the request was received by the middleware
    pub timestamp: SystemTime,
    /// HTTP method (GET, POST, etc.)
    pub method: Method,
    /// Request URI including path and query parameters
    pub uri: Uri,
    /// Client address, when the server was started with connect info
    pub remote_addr: Option<SocketAddr>,
    /// HTTP status code of the response
    pub status: StatusCode,
    /// Time elapsed from when the request was received to when response headers were ready
    pub duration_to_first_byte: Duration,
    /// Total time elapsed from request start to completion of response stream.
    /// Equals duration_to_first_byte when the response body was not mirrored.
    pub duration: Duration,
    /// Attributes emitted by the collector, in emission order
    pub attrs: Vec<Attr>,
}

impl LogRecord {
    /// Value of the first attribute named `key`.
    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| &attr.value)
    }
}
