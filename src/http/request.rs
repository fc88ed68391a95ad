//! Request preparation.
//!
//! # Responsibilities
//! - Accept only protocol-valid request methods
//! - Turn the command's header map into a `HeaderMap`
//! - Map the cache flag onto request cache directives
//! - Resolve the per-command URL path against the connection URL

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::Method;
use url::Url;

use super::executor::ExecutorError;

/// Methods a data command may use. Case-sensitive, as on the wire.
const METHODS: [&str; 8] = ["GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "PATCH"];

pub fn parse_method(raw: &str) -> Result<Method, ExecutorError> {
    if !METHODS.contains(&raw) {
        return Err(ExecutorError::Syntax(format!("invalid HTTP method {:?}", raw)));
    }
    Method::from_bytes(raw.as_bytes())
        .map_err(|e| ExecutorError::Syntax(format!("invalid HTTP method {:?}: {}", raw, e)))
}

/// Build request headers. Entries with a blank name are dropped.
///
/// Names are case-insensitive, so two entries differing only in case are a
/// syntax error. Without `use_cache`, `Cache-Control: no-cache` and
/// `Pragma: no-cache` are each added unless the caller set that header.
pub fn build_headers(
    headers: Option<&BTreeMap<String, String>>,
    use_cache: bool,
) -> Result<HeaderMap, ExecutorError> {
    let mut map = HeaderMap::new();

    for (name, value) in headers.into_iter().flatten() {
        if name.trim().is_empty() {
            tracing::debug!(value = %value, "Dropping request header without a name");
            continue;
        }
        let header_name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| ExecutorError::Syntax(format!("invalid header name {:?}: {}", name, e)))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| ExecutorError::Syntax(format!("invalid value for header {:?}: {}", name, e)))?;
        if map.contains_key(&header_name) {
            return Err(ExecutorError::Syntax(format!("duplicate header {:?}", header_name.as_str())));
        }
        tracing::debug!(name = %header_name, value = %value, "Set request header");
        map.insert(header_name, header_value);
    }

    if !use_cache {
        for name in [CACHE_CONTROL, PRAGMA] {
            if !map.contains_key(&name) {
                map.insert(name, HeaderValue::from_static("no-cache"));
            }
        }
    }

    Ok(map)
}

/// Append the command's `urlPath` to the connection URL.
pub fn target_url(base: &Url, path: Option<&str>) -> Result<Url, ExecutorError> {
    let path = match path.map(str::trim) {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(base.clone()),
    };

    let root = base.as_str().trim_end_matches('/');
    let joined = if path.starts_with('/') || path.starts_with('?') {
        format!("{}{}", root, path)
    } else {
        format!("{}/{}", root, path)
    };

    Url::parse(&joined).map_err(|e| ExecutorError::Syntax(format!("invalid url {:?}: {}", joined, e)))
}

/// Whether an input channel may supply a body for this method.
pub fn allows_request_body(method: &Method) -> bool {
    !matches!(*method, Method::HEAD | Method::TRACE)
}
