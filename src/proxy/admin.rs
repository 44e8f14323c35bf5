//! Channel CRUD, stats, logs and circuit inspection under `/admin`.

use axum::body::Body;
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{ProxyService, now_ms, parse_json, read_body};
use crate::breaker::CircuitState;
use crate::config::{ChannelConfig, ProxyConfig, SchemeConfig};
use crate::error::ProxyError;
use crate::stats::StatsSnapshot;

#[derive(Debug, Serialize)]
struct ChannelView {
    id: String,
    scheme: String,
    priority: i64,
    base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable_secs: Option<u64>,
    circuit: CircuitState,
}

#[derive(Debug, Serialize)]
struct SchemeView {
    name: String,
    channels: Vec<ChannelView>,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    schemes: Vec<SchemeView>,
}

fn redact(key: &str) -> String {
    let chars = key.chars().collect::<Vec<_>>();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("****{tail}")
}

fn channel_view(proxy: &ProxyService, scheme: &str, ch: &ChannelConfig) -> ChannelView {
    ChannelView {
        id: ch.id.clone(),
        scheme: scheme.to_string(),
        priority: ch.priority,
        base_url: ch.base_url.clone(),
        api_key: ch.api_key.as_deref().map(redact),
        api_key_env: ch.api_key_env.clone(),
        model: ch.model.clone(),
        failure_threshold: ch.failure_threshold,
        disable_secs: ch.disable_secs,
        circuit: proxy.state().breaker.circuit_state(&ch.id),
    }
}

/// Body of `POST /admin/config`.
#[derive(Debug, Deserialize)]
struct NewChannel {
    scheme: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    priority: i64,
    base_url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_key_env: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    failure_threshold: Option<u32>,
    #[serde(default)]
    disable_secs: Option<u64>,
}

/// Body of `PUT /admin/config/{id}`; absent fields keep their current value. Setting `scheme`
/// moves the channel.
#[derive(Debug, Default, Deserialize)]
struct ChannelPatch {
    scheme: Option<String>,
    priority: Option<i64>,
    base_url: Option<String>,
    api_key: Option<String>,
    api_key_env: Option<String>,
    model: Option<String>,
    failure_threshold: Option<u32>,
    disable_secs: Option<u64>,
}

fn validate_base_url(url: &str) -> Result<(), ProxyError> {
    match reqwest::Url::parse(url.trim()) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => Ok(()),
        _ => Err(ProxyError::InvalidRequest(format!(
            "base_url '{url}' is not an http(s) URL"
        ))),
    }
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Appends `channel` to the named scheme, creating the scheme at the end of the registry.
fn insert_channel(cfg: &mut ProxyConfig, scheme: &str, channel: ChannelConfig) {
    match cfg.schemes.iter_mut().find(|s| s.name == scheme) {
        Some(s) => s.channels.push(channel),
        None => cfg.schemes.push(SchemeConfig {
            name: scheme.to_string(),
            channels: vec![channel],
        }),
    }
}

fn remove_channel(cfg: &mut ProxyConfig, id: &str) -> Option<(String, ChannelConfig)> {
    cfg.schemes.iter_mut().find_map(|s| {
        let idx = s.channels.iter().position(|c| c.id == id)?;
        Some((s.name.clone(), s.channels.remove(idx)))
    })
}

/// Applies `patch` to channel `id`. The channel keeps its position unless it moves to another
/// scheme, where it is appended.
fn patch_channel(
    cfg: &mut ProxyConfig,
    id: &str,
    patch: ChannelPatch,
) -> Result<(String, ChannelConfig), ProxyError> {
    let current_scheme = cfg
        .find_channel(id)
        .map(|(s, _)| s.name.clone())
        .ok_or_else(|| ProxyError::ChannelNotFound(id.to_string()))?;
    let target = non_blank(patch.scheme.clone()).unwrap_or_else(|| current_scheme.clone());

    let apply = |ch: &mut ChannelConfig, patch: ChannelPatch| {
        if let Some(p) = patch.priority {
            ch.priority = p;
        }
        if let Some(url) = patch.base_url {
            ch.base_url = url.trim().to_string();
        }
        if let Some(k) = patch.api_key {
            ch.api_key = non_blank(Some(k));
        }
        if let Some(k) = patch.api_key_env {
            ch.api_key_env = non_blank(Some(k));
        }
        if let Some(m) = patch.model {
            ch.model = non_blank(Some(m));
        }
        if let Some(t) = patch.failure_threshold {
            ch.failure_threshold = Some(t).filter(|&t| t > 0);
        }
        if let Some(d) = patch.disable_secs {
            ch.disable_secs = Some(d);
        }
    };

    if target == current_scheme {
        let ch = cfg
            .schemes
            .iter_mut()
            .flat_map(|s| s.channels.iter_mut())
            .find(|c| c.id == id)
            .ok_or_else(|| ProxyError::ChannelNotFound(id.to_string()))?;
        apply(ch, patch);
        return Ok((target, ch.clone()));
    }

    let (_, mut ch) =
        remove_channel(cfg, id).ok_or_else(|| ProxyError::ChannelNotFound(id.to_string()))?;
    apply(&mut ch, patch);
    insert_channel(cfg, &target, ch.clone());
    Ok((target, ch))
}

async fn get_config(
    proxy: ProxyService,
    headers: HeaderMap,
) -> Result<Json<ConfigView>, ProxyError> {
    let cfg = proxy.authorize(&headers).await?;
    let schemes = cfg
        .schemes
        .iter()
        .map(|s| SchemeView {
            name: s.name.clone(),
            channels: s
                .channels
                .iter()
                .map(|c| channel_view(&proxy, &s.name, c))
                .collect(),
        })
        .collect();
    Ok(Json(ConfigView { schemes }))
}

async fn create_channel(
    proxy: ProxyService,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<ChannelView>), ProxyError> {
    let cfg = proxy.authorize(&headers).await?;
    let body = read_body(&headers, body, cfg.server.max_body_bytes()).await?;
    let input: NewChannel = parse_json(&body)?;
    let scheme = input.scheme.trim().to_string();
    if scheme.is_empty() {
        return Err(ProxyError::InvalidRequest("scheme is required".to_string()));
    }
    validate_base_url(&input.base_url)?;
    let channel = ChannelConfig {
        id: non_blank(input.id).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        priority: input.priority,
        base_url: input.base_url.trim().to_string(),
        api_key: non_blank(input.api_key),
        api_key_env: non_blank(input.api_key_env),
        model: non_blank(input.model),
        failure_threshold: input.failure_threshold,
        disable_secs: input.disable_secs,
    };

    let (_, created) = proxy
        .runtime_config()
        .update(|cfg| {
            if cfg.contains_channel(&channel.id) {
                return Err(ProxyError::InvalidRequest(format!(
                    "channel id '{}' already exists",
                    channel.id
                )));
            }
            insert_channel(cfg, &scheme, channel.clone());
            Ok(channel)
        })
        .await?;
    proxy.state().logs.info(format!(
        "[{}] channel {} created ({})",
        scheme, created.id, created.base_url
    ));
    Ok((
        StatusCode::CREATED,
        Json(channel_view(&proxy, &scheme, &created)),
    ))
}

async fn update_channel(
    proxy: ProxyService,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<ChannelView>, ProxyError> {
    let cfg = proxy.authorize(&headers).await?;
    let body = read_body(&headers, body, cfg.server.max_body_bytes()).await?;
    let patch: ChannelPatch = parse_json(&body)?;
    if let Some(url) = patch.base_url.as_deref() {
        validate_base_url(url)?;
    }

    let (cfg, (scheme, updated)) = proxy
        .runtime_config()
        .update(|cfg| patch_channel(cfg, &id, patch))
        .await?;
    proxy.state().selector.retain_known(&cfg);
    proxy
        .state()
        .logs
        .info(format!("[{}] channel {} updated", scheme, updated.id));
    Ok(Json(channel_view(&proxy, &scheme, &updated)))
}

async fn delete_channel(
    proxy: ProxyService,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ProxyError> {
    proxy.authorize(&headers).await?;
    let (cfg, (scheme, _)) = proxy
        .runtime_config()
        .update(|cfg| remove_channel(cfg, &id).ok_or_else(|| ProxyError::ChannelNotFound(id.clone())))
        .await?;
    let state = proxy.state();
    state.breaker.forget(&id);
    state.selector.retain_known(&cfg);
    state
        .logs
        .info(format!("[{scheme}] channel {id} deleted"));
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(
    proxy: ProxyService,
    headers: HeaderMap,
) -> Result<Json<StatsSnapshot>, ProxyError> {
    proxy.authorize(&headers).await?;
    Ok(Json(proxy.state().stats.snapshot()))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

async fn get_logs(
    proxy: ProxyService,
    headers: HeaderMap,
    Query(q): Query<LogsQuery>,
) -> Result<Json<Vec<String>>, ProxyError> {
    proxy.authorize(&headers).await?;
    Ok(Json(proxy.state().logs.recent(q.limit)))
}

#[derive(Debug, Serialize)]
struct CircuitView {
    id: String,
    eligible: bool,
    #[serde(flatten)]
    state: CircuitState,
}

async fn get_circuit(
    proxy: ProxyService,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<CircuitView>, ProxyError> {
    let cfg = proxy.authorize(&headers).await?;
    if !cfg.contains_channel(&id) {
        return Err(ProxyError::ChannelNotFound(id));
    }
    let state = proxy.state().breaker.circuit_state(&id);
    Ok(Json(CircuitView {
        eligible: state.is_eligible(now_ms()),
        id,
        state,
    }))
}

async fn list_circuits(
    proxy: ProxyService,
    headers: HeaderMap,
) -> Result<Json<Vec<CircuitView>>, ProxyError> {
    let cfg = proxy.authorize(&headers).await?;
    let now = now_ms();
    let mut out = proxy
        .state()
        .breaker
        .snapshot()
        .into_iter()
        .filter(|(id, _)| cfg.contains_channel(id))
        .map(|(id, state)| CircuitView {
            eligible: state.is_eligible(now),
            id,
            state,
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Json(out))
}

#[derive(Debug, Serialize)]
struct ReloadResult {
    schemes: usize,
    channels: usize,
}

async fn reload_config(
    proxy: ProxyService,
    headers: HeaderMap,
) -> Result<Json<ReloadResult>, ProxyError> {
    proxy.authorize(&headers).await?;
    let cfg = proxy.runtime_config().force_reload().await?;
    proxy.state().forget_removed(&cfg);
    proxy.state().logs.info(format!(
        "config reloaded on request: {} scheme(s), {} channel(s)",
        cfg.schemes.len(),
        cfg.channel_count()
    ));
    Ok(Json(ReloadResult {
        schemes: cfg.schemes.len(),
        channels: cfg.channel_count(),
    }))
}

pub(super) fn router(proxy: ProxyService) -> Router {
    let p0 = proxy.clone();
    let p1 = proxy.clone();
    let p2 = proxy.clone();
    let p3 = proxy.clone();
    let p4 = proxy.clone();
    let p5 = proxy.clone();
    let p6 = proxy.clone();
    let p7 = proxy.clone();
    let p8 = proxy;

    Router::new()
        .route(
            "/admin/config",
            get(move |h| get_config(p0.clone(), h))
                .post(move |h, body| create_channel(p1.clone(), h, body)),
        )
        .route(
            "/admin/config/reload",
            post(move |h| reload_config(p2.clone(), h)),
        )
        .route(
            "/admin/config/{id}",
            put(move |id, h, body| update_channel(p3.clone(), id, h, body))
                .delete(move |id, h| delete_channel(p4.clone(), id, h)),
        )
        .route("/admin/stats", get(move |h| get_stats(p5.clone(), h)))
        .route("/admin/logs", get(move |h, q| get_logs(p6.clone(), h, q)))
        .route("/admin/circuit", get(move |h| list_circuits(p8.clone(), h)))
        .route(
            "/admin/circuit/{id}",
            get(move |id, h| get_circuit(p7.clone(), id, h)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn redaction_keeps_only_the_tail() {
        assert_eq!(redact("sk-1234567890abcd"), "****abcd");
        assert_eq!(redact("short"), "****");
    }

    #[test]
    fn insert_creates_missing_scheme_at_the_end() {
        let mut cfg = ProxyConfig::default();
        let ch = ChannelConfig {
            id: "a".to_string(),
            priority: 1,
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: None,
            api_key_env: None,
            model: None,
            failure_threshold: None,
            disable_secs: None,
        };
        insert_channel(&mut cfg, "pool-a", ch.clone());
        insert_channel(&mut cfg, "pool-b", ChannelConfig { id: "b".to_string(), ..ch.clone() });
        insert_channel(&mut cfg, "pool-a", ChannelConfig { id: "c".to_string(), ..ch });
        assert_eq!(cfg.schemes[0].channels.len(), 2);
        assert_eq!(cfg.schemes[1].name, "pool-b");

        let (scheme, removed) = remove_channel(&mut cfg, "c").unwrap();
        assert_eq!((scheme.as_str(), removed.id.as_str()), ("pool-a", "c"));
        assert!(remove_channel(&mut cfg, "c").is_none());
    }

    fn ids(cfg: &ProxyConfig, scheme: usize) -> Vec<&str> {
        cfg.schemes[scheme].channels.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn patch_keeps_position_unless_the_scheme_changes() {
        let mut cfg = ProxyConfig::default();
        let ch = ChannelConfig {
            id: "a".to_string(),
            priority: 1,
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: None,
            api_key_env: None,
            model: None,
            failure_threshold: None,
            disable_secs: None,
        };
        for id in ["a", "b", "c"] {
            insert_channel(&mut cfg, "pool-a", ChannelConfig { id: id.to_string(), ..ch.clone() });
        }

        let patch = ChannelPatch {
            base_url: Some("http://127.0.0.1:10/v1".to_string()),
            scheme: Some("pool-a".to_string()),
            ..Default::default()
        };
        let (scheme, updated) = patch_channel(&mut cfg, "a", patch).unwrap();
        assert_eq!(scheme, "pool-a");
        assert_eq!(updated.base_url, "http://127.0.0.1:10/v1");
        assert_eq!(ids(&cfg, 0), vec!["a", "b", "c"]);
        assert_eq!(cfg.schemes[0].channels[0].base_url, "http://127.0.0.1:10/v1");

        let patch = ChannelPatch {
            scheme: Some("pool-b".to_string()),
            priority: Some(2),
            ..Default::default()
        };
        let (scheme, updated) = patch_channel(&mut cfg, "b", patch).unwrap();
        assert_eq!((scheme.as_str(), updated.priority), ("pool-b", 2));
        assert_eq!(ids(&cfg, 0), vec!["a", "c"]);
        assert_eq!(ids(&cfg, 1), vec!["b"]);

        assert!(matches!(
            patch_channel(&mut cfg, "zz", ChannelPatch::default()),
            Err(ProxyError::ChannelNotFound(_))
        ));
    }
}
