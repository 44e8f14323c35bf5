//! Heuristic labels for upstream failures. They only enrich log lines; failover treats every
//! failure the same way.

use axum::http::HeaderMap;
use serde_json::Value;

pub const MALFORMED_BODY: &str = "malformed_body";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamClass {
    pub class: Option<&'static str>,
    pub hint: Option<&'static str>,
    pub cf_ray: Option<String>,
}

fn header_value_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.len() >= needle.len() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn looks_like_cloudflare_challenge_html(headers: &HeaderMap, body: &[u8]) -> bool {
    if !content_type(headers).starts_with("text/html") {
        return false;
    }
    contains_bytes(body, b"__CF$cv$params")
        || contains_bytes(body, b"/cdn-cgi/")
        || contains_bytes(body, b"challenge-platform")
        || contains_bytes(body, b"cf-chl-")
}

fn extract_error_type(v: &Value) -> Option<&str> {
    let err = v.get("error")?;
    err.get("type")
        .and_then(Value::as_str)
        .or_else(|| err.get("code").and_then(Value::as_str))
}

pub fn classify_upstream_response(
    status_code: u16,
    headers: &HeaderMap,
    body: &[u8],
) -> UpstreamClass {
    let cf_ray = header_value_str(headers, "cf-ray");
    let server = header_value_str(headers, "server")
        .unwrap_or_default()
        .to_ascii_lowercase();
    let looks_cf = server.contains("cloudflare") || cf_ray.is_some();

    let (class, hint) = if looks_cf && status_code == 524 {
        (
            Some("cloudflare_timeout"),
            Some("origin did not answer in time behind Cloudflare; check upstream latency"),
        )
    } else if looks_like_cloudflare_challenge_html(headers, body) {
        (
            Some("cloudflare_challenge"),
            Some("got a Cloudflare/WAF challenge page instead of an API response"),
        )
    } else if status_code == 429 {
        (Some("rate_limited"), None)
    } else if matches!(status_code, 401 | 403) {
        (Some("auth_rejected"), Some("check the channel's api key"))
    } else if matches!(status_code, 400 | 409 | 413 | 415 | 422)
        && content_type(headers).contains("json")
        && let Ok(v) = serde_json::from_slice::<Value>(body)
        && extract_error_type(&v).is_some_and(|t| {
            matches!(
                t.to_ascii_lowercase().as_str(),
                "invalid_request_error"
                    | "validation_error"
                    | "bad_request"
                    | "context_length_exceeded"
                    | "content_filter"
            )
        })
    {
        (
            Some("client_error"),
            Some("the request itself was rejected; other channels will likely reject it too"),
        )
    } else if status_code >= 500 {
        (Some("upstream_server_error"), None)
    } else {
        (None, None)
    };

    UpstreamClass {
        class,
        hint,
        cf_ray,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use pretty_assertions::assert_eq;

    #[test]
    fn cloudflare_524_is_a_timeout() {
        let mut h = HeaderMap::new();
        h.insert("server", HeaderValue::from_static("cloudflare"));
        h.insert("cf-ray", HeaderValue::from_static("abc-SJC"));
        let c = classify_upstream_response(524, &h, b"");
        assert_eq!(c.class, Some("cloudflare_timeout"));
        assert_eq!(c.cf_ray.as_deref(), Some("abc-SJC"));
    }

    #[test]
    fn challenge_page_is_detected_from_html_markers() {
        let mut h = HeaderMap::new();
        h.insert("content-type", HeaderValue::from_static("text/html; charset=utf-8"));
        let c = classify_upstream_response(403, &h, b"<script src=\"/cdn-cgi/challenge-platform\">");
        assert_eq!(c.class, Some("cloudflare_challenge"));
    }

    #[test]
    fn json_validation_errors_are_client_errors() {
        let mut h = HeaderMap::new();
        h.insert("content-type", HeaderValue::from_static("application/json"));
        let body = br#"{"error":{"type":"invalid_request_error","message":"bad"}}"#;
        assert_eq!(
            classify_upstream_response(400, &h, body).class,
            Some("client_error")
        );
        assert_eq!(classify_upstream_response(400, &h, b"{}").class, None);
        assert_eq!(
            classify_upstream_response(502, &h, b"").class,
            Some("upstream_server_error")
        );
    }
}
