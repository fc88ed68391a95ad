//! Response mapping.
//!
//! # Responsibilities
//! - Read the status line (code and reason phrase)
//! - Convert response headers to the list-valued wire map
//! - Decide whether a body is expected and whether the status is a failure

use std::collections::BTreeMap;

use reqwest::header::HeaderMap;
use reqwest::{Method, Response, StatusCode};

/// Reason phrase as sent by the server, falling back to the canonical one.
pub fn reason_phrase(response: &Response) -> String {
    response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
        .map(str::to_string)
        .or_else(|| response.status().canonical_reason().map(str::to_string))
        .unwrap_or_default()
}

/// Group header values by name, keeping repeated headers in order.
pub fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut collected: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        collected
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    collected
}

pub fn is_error_status(status: StatusCode) -> bool {
    status.as_u16() >= 400
}

/// Whether the response to `method` can carry a body at `status`.
pub fn allows_response_body(method: &Method, status: StatusCode) -> bool {
    *method != Method::HEAD
        && !status.is_informational()
        && status != StatusCode::NO_CONTENT
        && status != StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderValue, SET_COOKIE};

    #[test]
    fn repeated_headers_keep_every_value() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        let collected = collect_headers(&headers);
        assert_eq!(collected["set-cookie"], vec!["a=1", "b=2"]);
        assert_eq!(collected["content-type"], vec!["text/plain"]);
    }

    #[test]
    fn error_boundary_is_400() {
        assert!(!is_error_status(StatusCode::from_u16(399).unwrap()));
        assert!(is_error_status(StatusCode::BAD_REQUEST));
        assert!(is_error_status(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[test]
    fn bodyless_responses() {
        assert!(allows_response_body(&Method::GET, StatusCode::OK));
        assert!(!allows_response_body(&Method::HEAD, StatusCode::OK));
        assert!(!allows_response_body(&Method::GET, StatusCode::NO_CONTENT));
        assert!(!allows_response_body(&Method::GET, StatusCode::NOT_MODIFIED));
    }
}
