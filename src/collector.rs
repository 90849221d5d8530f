//! Turning captured request state into log attributes.
//!
//! [`Collector::collect`] is a pure read: it looks at the request snapshot, the captured
//! request body and the response view, asks the config provider which switches are on, and
//! emits key-value [`Attr`]s. It never mutates what it reads, so collecting twice yields the
//! same attributes.

use axum::{
    extract::{ConnectInfo, Request},
    http::{HeaderMap, Method, StatusCode, Uri},
};
use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::value::RawValue;
use std::{fmt, net::SocketAddr, sync::Arc};

use crate::{
    body_wrapper::CapturedBody,
    config::ConfigProvider,
    content_type::{content_type_of, should_log_body},
    exclusion::ExclusionPolicy,
};

/// Value of a log attribute.
#[derive(Debug, Clone)]
pub enum AttrValue {
    /// Plain text, including non-JSON bodies (invalid UTF-8 is replaced)
    Text(String),
    /// A length in bytes
    Len(usize),
    /// A full header set
    Headers(HeaderMap),
    /// A JSON body kept verbatim so sinks can embed it without re-encoding
    Json(Box<RawValue>),
}

impl PartialEq for AttrValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => a == b,
            (Self::Len(a), Self::Len(b)) => a == b,
            (Self::Headers(a), Self::Headers(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a.get() == b.get(),
            _ => false,
        }
    }
}

impl AttrValue {
    /// Text content for `Text` and `Json` values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Json(raw) => Some(raw.get()),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Len(len) => write!(f, "{len}"),
            Self::Headers(headers) => write!(f, "{headers:?}"),
            Self::Json(raw) => f.write_str(raw.get()),
        }
    }
}

impl Serialize for AttrValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(text) => serializer.serialize_str(text),
            Self::Len(len) => serializer.serialize_u64(*len as u64),
            Self::Json(raw) => raw.serialize(serializer),
            Self::Headers(headers) => {
                let mut map = serializer.serialize_map(Some(headers.keys_len()))?;
                for name in headers.keys() {
                    let values: Vec<_> = headers
                        .get_all(name)
                        .iter()
                        .map(|value| String::from_utf8_lossy(value.as_bytes()))
                        .collect();
                    map.serialize_entry(name.as_str(), &values)?;
                }
                map.end()
            }
        }
    }
}

/// A single key-value log attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attr {
    pub key: &'static str,
    pub value: AttrValue,
}

impl Attr {
    pub fn text(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: AttrValue::Text(value.into()),
        }
    }

    pub fn len(key: &'static str, len: usize) -> Self {
        Self {
            key,
            value: AttrValue::Len(len),
        }
    }

    pub fn headers(key: &'static str, headers: &HeaderMap) -> Self {
        Self {
            key,
            value: AttrValue::Headers(headers.clone()),
        }
    }

    /// A body attribute: raw JSON for content types ending in `json`, text otherwise.
    ///
    /// Bytes labelled as JSON that fail to parse are logged as text.
    pub fn body(key: &'static str, data: &[u8], content_type: &str) -> Self {
        if content_type.ends_with("json") {
            if let Ok(raw) = serde_json::from_slice::<&RawValue>(data) {
                return Self {
                    key,
                    value: AttrValue::Json(raw.to_owned()),
                };
            }
        }
        Self::text(key, String::from_utf8_lossy(data))
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Request metadata recorded before the request is handed to the inner service.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestSnapshot {
    pub fn from_request(request: &Request) -> Self {
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            remote_addr: request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        }
    }
}

/// What the collector may see of the response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
    /// Mirrored body bytes; `None` when the response body was not captured
    pub body: Option<&'a [u8]>,
}

/// Builds log attributes for a request from the current configuration.
#[derive(Clone)]
pub struct Collector {
    config: Arc<dyn ConfigProvider>,
    exclusions: Arc<ExclusionPolicy>,
}

impl Collector {
    pub fn new(config: Arc<dyn ConfigProvider>, exclusions: Arc<ExclusionPolicy>) -> Self {
        Self { config, exclusions }
    }

    /// Emit the attributes for one request.
    ///
    /// Nothing is emitted for excluded paths. Body lengths are emitted whenever a body was
    /// captured; the body itself only when its content type is allowed and it fits
    /// `bodymaxlen`.
    pub fn collect(
        &self,
        request: &RequestSnapshot,
        request_body: Option<&CapturedBody>,
        response: &ResponseView<'_>,
        emit: &mut dyn FnMut(Attr),
    ) {
        if self.exclusions.is_excluded(request.uri.path()) {
            return;
        }

        let options = self.config.current();

        if options.query {
            emit(Attr::text("query", request.uri.query().unwrap_or_default()));
        }

        if options.reqheaders {
            emit(Attr::headers("reqheaders", &request.headers));
        }

        if options.respheaders {
            emit(Attr::headers("respheaders", response.headers));
        }

        if let Some(body) = request_body {
            emit(Attr::len("reqbodylen", body.len()));
            if should_log_body(&body.content_type, body.len(), &options) {
                emit(Attr::body("reqbody", &body.data, &body.content_type));
            }
        }

        if let Some(data) = response.body {
            emit(Attr::len("respbodylen", data.len()));
            let content_type = content_type_of(response.headers);
            if should_log_body(&content_type, data.len(), &options) {
                emit(Attr::body("respbody", data, &content_type));
            }
        }
    }

    /// Collect into a vector.
    pub fn collect_vec(
        &self,
        request: &RequestSnapshot,
        request_body: Option<&CapturedBody>,
        response: &ResponseView<'_>,
    ) -> Vec<Attr> {
        let mut attrs = Vec::new();
        self.collect(request, request_body, response, &mut |attr| attrs.push(attr));
        attrs
    }
}
