//! Streaming relay: wait for the first upstream chunk under the attempt timeout, then hand the
//! rest of the body to the caller as it arrives.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, Response};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};

use super::failover::AttemptError;
use super::{AppState, filter_response_headers};

enum RelayOutcome {
    Open,
    Completed,
    Failed(String),
}

/// Logs how the relay ended once the caller's body is dropped.
struct StreamFinalize {
    state: Arc<AppState>,
    scheme: String,
    channel_id: String,
    start: Instant,
    chunks: u64,
    bytes: u64,
    outcome: RelayOutcome,
}

impl StreamFinalize {
    fn record_chunk(&mut self, len: usize) {
        self.chunks += 1;
        self.bytes += len as u64;
    }
}

impl Drop for StreamFinalize {
    fn drop(&mut self) {
        let elapsed = humantime::format_duration(Duration::from_millis(
            self.start.elapsed().as_millis() as u64,
        ));
        let logs = &self.state.logs;
        match &self.outcome {
            RelayOutcome::Completed => logs.info(format!(
                "[{}] channel {} stream finished: {} chunk(s), {} bytes in {}",
                self.scheme, self.channel_id, self.chunks, self.bytes, elapsed
            )),
            RelayOutcome::Failed(err) => logs.warn(format!(
                "[{}] channel {} stream aborted after {} chunk(s), {} bytes: {}",
                self.scheme, self.channel_id, self.chunks, self.bytes, err
            )),
            RelayOutcome::Open => logs.info(format!(
                "[{}] client disconnected from channel {} stream after {} chunk(s), {} bytes in {}",
                self.scheme, self.channel_id, self.chunks, self.bytes, elapsed
            )),
        }
    }
}

struct Relay {
    pending_first: Option<Bytes>,
    upstream: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    finalize: StreamFinalize,
}

/// Sends the request and waits for the first non-empty chunk. Everything up to that point is an
/// attempt failure the caller can fail over from; after it the channel is committed.
pub(super) async fn open(
    builder: reqwest::RequestBuilder,
    timeout: Duration,
    state: Arc<AppState>,
    scheme: &str,
    channel_id: &str,
) -> Result<Response<Body>, AttemptError> {
    let start = Instant::now();
    let probe = async {
        let resp = builder
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(e, timeout))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            return Err(AttemptError::from_response(status, &headers, &body));
        }

        let mut upstream = resp.bytes_stream().boxed();
        let first = loop {
            match upstream.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => break chunk,
                Some(Err(e)) => return Err(AttemptError::from_reqwest(e, timeout)),
                None => {
                    return Err(AttemptError::Network(
                        "stream ended before the first chunk".to_string(),
                    ));
                }
            }
        };
        Ok((status, headers, first, upstream))
    };
    let (status, headers, first, upstream) = tokio::time::timeout(timeout, probe)
        .await
        .map_err(|_| AttemptError::Timeout(timeout))??;

    let relay = Relay {
        pending_first: Some(first),
        upstream: Some(upstream),
        finalize: StreamFinalize {
            state,
            scheme: scheme.to_string(),
            channel_id: channel_id.to_string(),
            start,
            chunks: 0,
            bytes: 0,
            outcome: RelayOutcome::Open,
        },
    };

    // Dropping the body (client gone) drops `relay`, which cancels the upstream read.
    let body = stream::unfold(relay, |mut relay| async move {
        if let Some(first) = relay.pending_first.take() {
            relay.finalize.record_chunk(first.len());
            return Some((Ok(first), relay));
        }
        let upstream = relay.upstream.as_mut()?;
        match upstream.next().await {
            Some(Ok(chunk)) => {
                relay.finalize.record_chunk(chunk.len());
                Some((Ok(chunk), relay))
            }
            Some(Err(err)) => {
                // Ends the caller's body with an error so the truncation is visible on the wire.
                relay.upstream = None;
                relay.finalize.outcome = RelayOutcome::Failed(err.to_string());
                Some((Err(std::io::Error::other(err)), relay))
            }
            None => {
                relay.finalize.outcome = RelayOutcome::Completed;
                None
            }
        }
    });

    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = filter_response_headers(&headers);
    if !response.headers().contains_key("content-type") {
        response
            .headers_mut()
            .insert("content-type", HeaderValue::from_static("text/event-stream"));
    }
    Ok(response)
}
