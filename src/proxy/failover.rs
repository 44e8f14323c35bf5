use std::fmt;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use chrono::Utc;
use tracing::debug;

use super::classify::{MALFORMED_BODY, classify_upstream_response};
use super::{ChatCompletionRequest, ProxyService, filter_response_headers, now_ms, stream};
use crate::breaker::FailureEffect;
use crate::config::ChannelConfig;
use crate::error::ProxyError;
use crate::selector::Selection;
use crate::stats::Outcome;

const EXCERPT_CHARS: usize = 200;

/// Why a single upstream attempt failed. Never shown to the caller.
#[derive(Debug)]
pub(super) enum AttemptError {
    Timeout(Duration),
    Http {
        status: u16,
        excerpt: String,
        class: Option<&'static str>,
        hint: Option<&'static str>,
        cf_ray: Option<String>,
    },
    Network(String),
}

impl AttemptError {
    pub(super) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            AttemptError::Timeout(timeout)
        } else {
            AttemptError::Network(err.to_string())
        }
    }

    pub(super) fn from_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let c = classify_upstream_response(status.as_u16(), headers, body);
        AttemptError::Http {
            status: status.as_u16(),
            excerpt: excerpt(body),
            class: c.class,
            hint: c.hint,
            cf_ray: c.cf_ray,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Timeout(d) => {
                write!(f, "timed out after {}", humantime::format_duration(*d))
            }
            AttemptError::Network(e) => write!(f, "network error: {e}"),
            AttemptError::Http {
                status,
                excerpt,
                class,
                hint,
                cf_ray,
            } => {
                write!(f, "HTTP {status}")?;
                if let Some(class) = class {
                    write!(f, " [{class}]")?;
                }
                if !excerpt.is_empty() {
                    write!(f, ": {excerpt}")?;
                }
                if let Some(hint) = hint {
                    write!(f, " ({hint})")?;
                }
                if let Some(ray) = cf_ray {
                    write!(f, " cf-ray={ray}")?;
                }
                Ok(())
            }
        }
    }
}

fn excerpt(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    let mut out = text.chars().take(EXCERPT_CHARS).collect::<String>();
    if text.chars().count() > EXCERPT_CHARS {
        out.push_str("...");
    }
    out.replace(['\n', '\r'], " ")
}

fn target_url(channel: &ChannelConfig) -> Result<reqwest::Url, AttemptError> {
    let base = channel.base_url.trim().trim_end_matches('/');
    reqwest::Url::parse(&format!("{base}/chat/completions"))
        .map_err(|e| AttemptError::Network(format!("invalid base_url '{}': {e}", channel.base_url)))
}

/// The caller's payload with the channel's model override applied.
fn upstream_body(request: &ChatCompletionRequest, channel: &ChannelConfig) -> Result<Bytes, ProxyError> {
    let data = match channel.model_override() {
        Some(model) => {
            let mut req = request.clone();
            req.model = model.to_string();
            serde_json::to_vec(&req)
        }
        None => serde_json::to_vec(request),
    }
    .map_err(|e| ProxyError::Internal(format!("failed to encode upstream request: {e}")))?;
    Ok(Bytes::from(data))
}

pub(super) fn build_request(
    proxy: &ProxyService,
    channel: &ChannelConfig,
    body: Bytes,
    stream: bool,
) -> Result<reqwest::RequestBuilder, AttemptError> {
    let url = target_url(channel)?;
    let accept = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    let mut builder = proxy
        .client
        .post(url)
        .header("content-type", "application/json")
        .header("accept", accept)
        .body(body);
    if let Some(key) = channel.resolve_api_key() {
        builder = builder.bearer_auth(key);
    }
    Ok(builder)
}

async fn send_buffered(
    builder: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<Response<Body>, AttemptError> {
    let exchange = async {
        let resp = builder
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(e, timeout))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AttemptError::from_reqwest(e, timeout))?;
        Ok::<_, AttemptError>((status, headers, bytes))
    };
    let (status, headers, bytes) = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| AttemptError::Timeout(timeout))??;

    if !status.is_success() {
        return Err(AttemptError::from_response(status, &headers, &bytes));
    }
    if serde_json::from_slice::<serde::de::IgnoredAny>(&bytes).is_err() {
        return Err(AttemptError::Http {
            status: status.as_u16(),
            excerpt: excerpt(&bytes),
            class: Some(MALFORMED_BODY),
            hint: Some("2xx response whose body is not JSON"),
            cf_ray: None,
        });
    }

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = filter_response_headers(&headers);
    if !response.headers().contains_key("content-type") {
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static("application/json"));
    }
    Ok(response)
}

/// Tries each candidate once, in order, until one succeeds.
pub(super) async fn execute(
    proxy: &ProxyService,
    selection: &Selection,
    request: &ChatCompletionRequest,
) -> Result<Response<Body>, ProxyError> {
    let state = proxy.state();
    let is_stream = request.is_stream();
    let mut attempts = 0usize;

    for candidate in &selection.candidates {
        // Admin edits can land while earlier candidates are being tried.
        let live = proxy.runtime_config().snapshot().await;
        let Some((_, channel)) = live.find_channel(&candidate.id) else {
            state.logs.warn(format!(
                "[{}] channel {} no longer exists; skipped",
                selection.scheme, candidate.id
            ));
            continue;
        };
        attempts += 1;
        let timeout = Duration::from_secs(live.upstream.timeout_secs.max(1));
        let body = upstream_body(request, channel)?;
        let started = Instant::now();
        debug!(
            scheme = selection.scheme.as_str(),
            channel = channel.id.as_str(),
            attempt = attempts,
            "forwarding to {}",
            channel.base_url
        );

        let result = match build_request(proxy, channel, body, is_stream) {
            Ok(builder) if is_stream => {
                stream::open(builder, timeout, state.clone(), &selection.scheme, &channel.id).await
            }
            Ok(builder) => send_buffered(builder, timeout).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                state.breaker.record_success(&channel.id);
                state
                    .stats
                    .record_outcome(&channel.id, Outcome::Success, Utc::now());
                state.logs.info(format!(
                    "[{}] channel {} ok (HTTP {}, {}{})",
                    selection.scheme,
                    channel.id,
                    response.status().as_u16(),
                    humantime::format_duration(Duration::from_millis(
                        started.elapsed().as_millis() as u64
                    )),
                    if is_stream { ", first chunk" } else { "" }
                ));
                return Ok(response);
            }
            Err(err) => {
                let effect =
                    state
                        .breaker
                        .record_failure(&channel.id, channel.breaker_policy(), now_ms());
                state
                    .stats
                    .record_outcome(&channel.id, Outcome::Fail, Utc::now());
                state.logs.warn(format!(
                    "[{}] channel {} failed: {}",
                    selection.scheme, channel.id, err
                ));
                match effect {
                    FailureEffect::Counted(streak) => {
                        debug!(channel = channel.id.as_str(), streak, "failure counted");
                    }
                    FailureEffect::Opened { until_ms } => {
                        let secs = until_ms.saturating_sub(now_ms()) / 1000;
                        state.logs.warn(format!(
                            "[{}] channel {} disabled for {} after {} consecutive failure(s)",
                            selection.scheme,
                            channel.id,
                            humantime::format_duration(Duration::from_secs(secs)),
                            state.breaker.circuit_state(&channel.id).consecutive_fails
                        ));
                    }
                }
            }
        }
    }

    if attempts == 0 {
        return Err(ProxyError::NoEligibleChannel {
            scheme: selection.scheme.clone(),
        });
    }
    state.logs.warn(format!(
        "[{}] all {} candidate(s) failed for model '{}'",
        selection.scheme, attempts, request.model
    ));
    Err(ProxyError::AllCandidatesExhausted { attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn channel(base_url: &str) -> ChannelConfig {
        ChannelConfig {
            id: "c".to_string(),
            priority: 1,
            base_url: base_url.to_string(),
            api_key: None,
            api_key_env: None,
            model: None,
            failure_threshold: None,
            disable_secs: None,
        }
    }

    #[test]
    fn target_url_trims_trailing_slash() {
        let url = target_url(&channel("https://api.example.com/v1/")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/chat/completions");
        assert!(target_url(&channel("not a url")).is_err());
    }

    #[test]
    fn model_override_replaces_only_the_model() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"pool-a","messages":[{"role":"user","content":"hi"}],"temperature":0.2,"tools":[{"type":"function"}]}"#,
        )
        .unwrap();
        let mut ch = channel("http://x/v1");
        ch.model = Some("gpt-4o-mini".to_string());
        let body: serde_json::Value = serde_json::from_slice(&upstream_body(&req, &ch).unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["tools"][0]["type"], "function");
        assert!(body.get("stream").is_none());

        let body: serde_json::Value =
            serde_json::from_slice(&upstream_body(&req, &channel("http://x/v1")).unwrap()).unwrap();
        assert_eq!(body["model"], "pool-a");
    }

    #[test]
    fn display_includes_class_and_excerpt() {
        let err = AttemptError::Http {
            status: 524,
            excerpt: "timeout".to_string(),
            class: Some("cloudflare_timeout"),
            hint: None,
            cf_ray: None,
        };
        assert_eq!(err.to_string(), "HTTP 524 [cloudflare_timeout]: timeout");
        assert_eq!(excerpt(&[b'x'; 300]).len(), EXCERPT_CHARS + 3);
    }
}
