//! Content-type and size filtering for body capture.

use axum::http::{header::CONTENT_TYPE, HeaderMap};

use crate::config::LogOptions;

/// Strip parameters from a `Content-Type` value, leaving only `type/subtype`.
///
/// A value without parameters is returned trimmed. Malformed values are not rejected; they
/// simply come back as-is and fail to match the allow-list later.
///
/// ```rust
/// use periscope::content_type::normalize_content_type;
///
/// assert_eq!(normalize_content_type("application/json; charset=utf-8"), "application/json");
/// assert_eq!(normalize_content_type(" text/plain "), "text/plain");
/// ```
pub fn normalize_content_type(raw: &str) -> &str {
    match raw.split_once(';') {
        Some((mime, _params)) => mime.trim(),
        None => raw.trim(),
    }
}

/// Normalized `Content-Type` of a header map, or an empty string if absent or not UTF-8.
pub fn content_type_of(headers: &HeaderMap) -> String {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| normalize_content_type(value).to_string())
        .unwrap_or_default()
}

/// Whether `mime` matches any pattern in `allow_list`.
///
/// Patterns are matched case-sensitively and may be an exact MIME type, `type/*`,
/// `*/subtype`, or `*` (also `*/*`) to allow everything.
pub fn is_allowed<S: AsRef<str>>(mime: &str, allow_list: &[S]) -> bool {
    allow_list
        .iter()
        .any(|pattern| pattern_matches(pattern.as_ref(), mime))
}

fn pattern_matches(pattern: &str, mime: &str) -> bool {
    if pattern == mime || pattern == "*" {
        return true;
    }

    let (Some((ptype, psub)), Some((mtype, msub))) = (pattern.split_once('/'), mime.split_once('/'))
    else {
        return false;
    };

    match (ptype, psub) {
        ("*", "*") => true,
        (ptype, "*") => ptype == mtype,
        ("*", psub) => psub == msub,
        _ => false,
    }
}

/// Whether a body of `len` bytes may be logged under `max_len` (`<= 0` means unlimited).
pub fn within_size_limit(len: usize, max_len: i64) -> bool {
    max_len <= 0 || len as u64 <= max_len as u64
}

/// A body is loggable when its type is allowed and it fits the size cap.
pub fn should_log_body(mime: &str, len: usize, options: &LogOptions) -> bool {
    within_size_limit(len, options.bodymaxlen) && is_allowed(mime, &options.bodytypes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_normalize_content_type() {
        assert_eq!(normalize_content_type("application/json"), "application/json");
        assert_eq!(
            normalize_content_type("text/html; charset=UTF-8"),
            "text/html"
        );
        assert_eq!(normalize_content_type("text/html ;q=1"), "text/html");
        assert_eq!(normalize_content_type(""), "");
        assert_eq!(normalize_content_type("garbage"), "garbage");
    }

    #[test]
    fn test_content_type_of() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_type_of(&headers), "");

        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert_eq!(content_type_of(&headers), "application/json");
    }

    #[test]
    fn test_is_allowed_wildcards() {
        let allow = ["text/*", "application/json", "*/xml"];
        assert!(is_allowed("text/plain", &allow));
        assert!(is_allowed("application/xml", &allow));
        assert!(is_allowed("application/json", &allow));
        assert!(!is_allowed("application/x-www-form-urlencoded", &allow));
    }

    #[test]
    fn test_is_allowed_exact_and_any() {
        assert!(is_allowed("application/json", &["application/json"]));
        assert!(!is_allowed("Application/JSON", &["application/json"]));
        assert!(is_allowed("image/png", &["*"]));
        assert!(is_allowed("image/png", &["*/*"]));
        assert!(!is_allowed("", &["text/*"]));
        assert!(!is_allowed("text/plain", &[] as &[&str]));
    }

    #[test]
    fn test_malformed_mime_never_matches_wildcards() {
        assert!(!is_allowed("text", &["text/*"]));
        assert!(!is_allowed("xml", &["*/xml"]));
    }

    #[test]
    fn test_within_size_limit() {
        assert!(within_size_limit(10_000, 0));
        assert!(within_size_limit(10_000, -1));
        assert!(within_size_limit(2048, 2048));
        assert!(!within_size_limit(2049, 2048));
        assert!(within_size_limit(0, 1));
    }

    #[test]
    fn test_should_log_body() {
        let options = LogOptions {
            bodymaxlen: 4,
            bodytypes: vec!["text/*".to_string()],
            ..LogOptions::default()
        };
        assert!(should_log_body("text/plain", 4, &options));
        assert!(!should_log_body("text/plain", 5, &options));
        assert!(!should_log_body("application/json", 1, &options));
    }
}
