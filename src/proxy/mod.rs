use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Response, header};
use axum::routing::{get, post};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::instrument;

mod admin;
mod classify;
mod failover;
mod runtime_config;
mod stream;

pub use self::runtime_config::RuntimeConfig;

use crate::breaker::CircuitBreaker;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logbuf::LogBuffer;
use crate::selector::CandidateSelector;
use crate::stats::StatsAggregator;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn is_hop_by_hop_header(name_lower: &str) -> bool {
    matches!(
        name_lower,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn hop_by_hop_connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Upstream headers safe to relay. The body is re-framed (and may have been decompressed by
/// reqwest), so its length and encoding headers are dropped too.
fn filter_response_headers(src: &HeaderMap) -> HeaderMap {
    let extra = hop_by_hop_connection_tokens(src);
    let mut out = HeaderMap::new();
    for (name, value) in src.iter() {
        let name_lower = name.as_str().to_ascii_lowercase();
        if is_hop_by_hop_header(&name_lower)
            || name_lower == "content-length"
            || name_lower == "content-encoding"
            || extra.iter().any(|t| t == &name_lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut cur = Some(err as &(dyn std::error::Error + 'static));
    while let Some(e) = cur {
        if e.to_string().contains("length limit exceeded") {
            return true;
        }
        cur = e.source();
    }
    false
}

/// Buffers a request body of at most `limit` bytes.
async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> Result<Bytes, ProxyError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some_and(|n| n > limit as u64) {
        return Err(ProxyError::PayloadTooLarge { limit });
    }
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        if is_length_limit(&e) {
            ProxyError::PayloadTooLarge { limit }
        } else {
            ProxyError::InvalidRequest(format!("failed to read request body: {e}"))
        }
    })
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("invalid JSON body: {e}")))
}

/// Process-wide routing state shared by every request.
pub struct AppState {
    pub breaker: CircuitBreaker,
    pub selector: CandidateSelector,
    pub stats: StatsAggregator,
    pub logs: LogBuffer,
}

impl AppState {
    pub fn with_stats(cfg: &ProxyConfig, stats: StatsAggregator) -> Self {
        Self {
            breaker: CircuitBreaker::new(),
            selector: CandidateSelector::new(),
            stats,
            logs: LogBuffer::new(cfg.logging.buffer_capacity, cfg.stats.utc_offset_minutes),
        }
    }

    /// Drops breaker and cursor state that refers to channels or groups missing from `cfg`.
    pub fn forget_removed(&self, cfg: &ProxyConfig) {
        self.breaker.retain_known(&cfg.channel_ids());
        self.selector.retain_known(cfg);
    }
}

#[derive(Clone)]
pub struct ProxyService {
    pub client: Client,
    config: Arc<RuntimeConfig>,
    state: Arc<AppState>,
}

impl ProxyService {
    pub fn new(client: Client, config: Arc<RuntimeConfig>, state: Arc<AppState>) -> Self {
        Self {
            client,
            config,
            state,
        }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn runtime_config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    /// The registry snapshot for one request, picking up on-disk edits first.
    async fn current_config(&self) -> Arc<ProxyConfig> {
        if let Some(cfg) = self.config.maybe_reload_from_disk().await {
            self.state.forget_removed(&cfg);
            self.state.logs.info(format!(
                "config reloaded from disk: {} scheme(s), {} channel(s)",
                cfg.schemes.len(),
                cfg.channel_count()
            ));
        }
        self.config.snapshot().await
    }

    /// Checks `Authorization: Bearer <admin key>` and returns the snapshot it was checked against.
    async fn authorize(&self, headers: &HeaderMap) -> Result<Arc<ProxyConfig>, ProxyError> {
        let cfg = self.current_config().await;
        let Some(expected) = cfg.resolve_admin_key() else {
            return Err(ProxyError::AdminKeyNotConfigured);
        };
        let presented = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        match presented {
            Some(token) if token == expected => Ok(cfg),
            _ => Err(ProxyError::Unauthorized),
        }
    }
}

/// OpenAI chat completion request. Everything besides `model` and `messages` (`stream` and
/// `tools` included) stays in `extra` and is forwarded exactly as sent, explicit nulls too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        matches!(self.extra.get("stream"), Some(Value::Bool(true)))
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.model.trim().is_empty() {
            return Err(ProxyError::InvalidRequest("model is required".to_string()));
        }
        match self.extra.get("stream") {
            None | Some(Value::Null) | Some(Value::Bool(_)) => Ok(()),
            Some(_) => Err(ProxyError::InvalidRequest(
                "stream must be a boolean".to_string(),
            )),
        }
    }
}

#[instrument(skip_all, fields(model = tracing::field::Empty, stream = tracing::field::Empty))]
pub async fn handle_chat_completions(
    proxy: ProxyService,
    headers: HeaderMap,
    body: Body,
) -> Result<Response<Body>, ProxyError> {
    let cfg = proxy.authorize(&headers).await?;
    let body = read_body(&headers, body, cfg.server.max_body_bytes()).await?;
    let request: ChatCompletionRequest = parse_json(&body)?;
    request.validate()?;
    let span = tracing::Span::current();
    span.record("model", request.model.as_str());
    span.record("stream", request.is_stream());

    let logs = &proxy.state.logs;
    let selection = match proxy.state.selector.select(
        &cfg,
        &request.model,
        &proxy.state.breaker,
        now_ms(),
    ) {
        Ok(s) => s,
        Err(err) => {
            logs.warn(format!("model '{}': {}", request.model, err));
            return Err(err);
        }
    };
    if selection.fell_back {
        logs.warn(format!(
            "scheme '{}' not found; falling back to '{}'",
            request.model, selection.scheme
        ));
    }
    if !selection.disabled.is_empty() {
        logs.info(format!(
            "[{}] skipping disabled channel(s): {}",
            selection.scheme,
            selection.disabled.join(", ")
        ));
    }

    failover::execute(&proxy, &selection, &request).await
}

async fn v1_status() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "message": format!("{} {} is running", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    }))
}

#[derive(Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: u64,
    owned_by: &'static str,
}

#[derive(Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelEntry>,
}

async fn list_models(proxy: ProxyService, headers: HeaderMap) -> Result<Json<ModelList>, ProxyError> {
    let cfg = proxy.authorize(&headers).await?;
    let data = cfg
        .schemes
        .iter()
        .map(|s| ModelEntry {
            id: s.name.clone(),
            object: "model",
            created: 1,
            owned_by: env!("CARGO_PKG_NAME"),
        })
        .collect();
    Ok(Json(ModelList {
        object: "list",
        data,
    }))
}

pub fn router(proxy: ProxyService) -> Router {
    let p0 = proxy.clone();
    let p1 = proxy.clone();

    Router::new()
        .route("/v1", get(v1_status))
        .route("/v1/models", get(move |h| list_models(p0.clone(), h)))
        .route(
            "/v1/chat/completions",
            post(move |h, b| handle_chat_completions(p1.clone(), h, b)),
        )
        .merge(admin::router(proxy))
}
