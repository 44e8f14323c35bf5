use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::breaker::BreakerPolicy;

/// Disable window applied when a channel sets `failure_threshold` but omits `disable_secs`.
pub const DEFAULT_DISABLE_SECS: u64 = 60;

/// One upstream backend inside a scheme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Stable identifier; generated on load when missing and persisted back.
    #[serde(default)]
    pub id: String,
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: i64,
    /// e.g. `https://api.openai.com/v1`; `/chat/completions` is appended.
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key (preferred over storing secrets on disk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Replaces the caller's `model` field when forwarding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Consecutive failures before the channel is disabled. Unset or 0 disables the breaker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_secs: Option<u64>,
}

impl ChannelConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref()
            && !key.trim().is_empty()
        {
            return Some(key.trim().to_string());
        }
        if let Some(env_name) = self.api_key_env.as_deref()
            && let Ok(v) = env::var(env_name.trim())
            && !v.trim().is_empty()
        {
            return Some(v.trim().to_string());
        }
        None
    }

    pub fn model_override(&self) -> Option<&str> {
        self.model.as_deref().map(str::trim).filter(|m| !m.is_empty())
    }

    pub fn breaker_policy(&self) -> Option<BreakerPolicy> {
        let threshold = self.failure_threshold.filter(|&n| n > 0)?;
        Some(BreakerPolicy {
            threshold,
            disable_secs: self.disable_secs.unwrap_or(DEFAULT_DISABLE_SECS),
        })
    }
}

/// A named pool of channels, selected through the caller's `model` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemeConfig {
    pub name: String,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest chat request body accepted, in MiB.
    #[serde(default = "default_max_body_mb")]
    pub max_body_mb: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_mb() -> usize {
    10
}

impl ServerConfig {
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_mb.max(1).saturating_mul(1024 * 1024)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_mb: default_max_body_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// Per-attempt timeout. For streaming requests it covers connect, headers and the first chunk.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    90
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Offset of the reference time zone used for day buckets, in minutes east of UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Closed days kept in the per-day history.
    #[serde(default = "default_history_days")]
    pub history_days: usize,
    /// How often stats are written to `stats.json` (0 = only on shutdown).
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

fn default_history_days() -> usize {
    30
}

fn default_flush_interval_secs() -> u64 {
    30
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            history_days: default_history_days(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Number of lines kept by the in-memory log served at `/admin/logs`.
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Write tracing output to `<home>/logs/runtime.log` instead of stdout.
    #[serde(default)]
    pub file: bool,
}

fn default_buffer_capacity() -> usize {
    200
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            file: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    /// Optional config schema version for future migrations
    #[serde(default)]
    pub version: Option<u32>,
    /// Shared bearer credential for both the proxy endpoint and the admin API.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_key_env: Option<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Ordered; the first scheme is the fallback for unknown `model` values.
    #[serde(default)]
    pub schemes: Vec<SchemeConfig>,
}

impl ProxyConfig {
    /// `ADMIN_KEY` in the environment wins over the config file.
    pub fn resolve_admin_key(&self) -> Option<String> {
        if let Ok(v) = env::var("ADMIN_KEY")
            && !v.trim().is_empty()
        {
            return Some(v.trim().to_string());
        }
        if let Some(key) = self.admin_key.as_deref()
            && !key.trim().is_empty()
        {
            return Some(key.trim().to_string());
        }
        if let Some(env_name) = self.admin_key_env.as_deref()
            && let Ok(v) = env::var(env_name.trim())
            && !v.trim().is_empty()
        {
            return Some(v.trim().to_string());
        }
        None
    }

    pub fn find_scheme(&self, name: &str) -> Option<&SchemeConfig> {
        self.schemes.iter().find(|s| s.name == name)
    }

    pub fn default_scheme(&self) -> Option<&SchemeConfig> {
        self.schemes.first()
    }

    /// Returns the scheme for `name`, falling back to the first scheme. The flag is true on fallback.
    pub fn resolve_scheme(&self, name: &str) -> Option<(&SchemeConfig, bool)> {
        if let Some(s) = self.find_scheme(name) {
            return Some((s, false));
        }
        self.default_scheme().map(|s| (s, true))
    }

    pub fn find_channel(&self, id: &str) -> Option<(&SchemeConfig, &ChannelConfig)> {
        self.schemes
            .iter()
            .find_map(|s| s.channels.iter().find(|c| c.id == id).map(|c| (s, c)))
    }

    pub fn contains_channel(&self, id: &str) -> bool {
        self.find_channel(id).is_some()
    }

    pub fn channel_ids(&self) -> HashSet<String> {
        self.schemes
            .iter()
            .flat_map(|s| s.channels.iter().map(|c| c.id.clone()))
            .collect()
    }

    pub fn channel_count(&self) -> usize {
        self.schemes.iter().map(|s| s.channels.len()).sum()
    }
}

pub fn config_warnings(cfg: &ProxyConfig) -> Vec<String> {
    let mut out = Vec::new();
    if cfg.resolve_admin_key().is_none() {
        out.push("admin key is not set (admin_key / admin_key_env / ADMIN_KEY); every request will be rejected".to_string());
    }
    if cfg.schemes.is_empty() {
        out.push("no schemes configured; every request will fail".to_string());
    }

    let mut scheme_names = HashSet::new();
    let mut ids = HashSet::new();
    for scheme in &cfg.schemes {
        if !scheme_names.insert(scheme.name.as_str()) {
            out.push(format!(
                "[{}] duplicate scheme name; only the first one is reachable",
                scheme.name
            ));
        }
        if scheme.channels.is_empty() {
            out.push(format!("[{}] scheme has no channels", scheme.name));
        }
        for ch in &scheme.channels {
            let name = format!("{}:{} ({})", scheme.name, ch.id, ch.base_url);
            if !ids.insert(ch.id.as_str()) {
                out.push(format!("[{name}] duplicate channel id"));
            }
            if ch.resolve_api_key().is_none() {
                out.push(format!("[{name}] no api_key (or api_key_env is unset)"));
            }
            if reqwest::Url::parse(ch.base_url.trim()).is_err() {
                out.push(format!("[{name}] base_url is not a valid URL"));
            }
            if ch.disable_secs.is_some() && ch.breaker_policy().is_none() {
                out.push(format!(
                    "[{name}] disable_secs is set without failure_threshold; the circuit breaker stays off"
                ));
            }
        }
    }
    out
}

fn config_dir() -> PathBuf {
    proxy_home_dir()
}

fn config_json_path() -> PathBuf {
    config_dir().join("config.json")
}

fn config_toml_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Return the primary config file path that will be used by `load_config()`.
pub fn config_file_path() -> PathBuf {
    let toml_path = config_toml_path();
    if toml_path.exists() {
        toml_path
    } else if config_json_path().exists() {
        config_json_path()
    } else {
        toml_path
    }
}

pub fn stats_file_path() -> PathBuf {
    config_dir().join("stats.json")
}

const CONFIG_VERSION: u32 = 1;

fn ensure_config_version(cfg: &mut ProxyConfig) {
    if cfg.version.is_none() {
        cfg.version = Some(CONFIG_VERSION);
    }
}

const CONFIG_TOML_DOC_HEADER: &str = r#"# catfish-agg config.toml
#
# Rewritten by the admin API; this header is kept on every save.
# Prefer api_key_env / admin_key_env over inline secrets.
"#;

const CONFIG_TOML_TEMPLATE: &str = r#"# catfish-agg config.toml
#
# Path: `~/.catfish-agg/config.toml` (override the directory with CATFISH_AGG_HOME).
# Regenerate with `catfish-agg config init --force`.

version = 1

# Shared bearer credential required on every request (`Authorization: Bearer <key>`).
# The ADMIN_KEY environment variable wins over both fields below.
# admin_key = "change-me"
admin_key_env = "CATFISH_ADMIN_KEY"

[server]
host = "0.0.0.0"
port = 8080  # PORT in the environment wins
# Chat requests larger than this (MiB) are rejected with 413.
max_body_mb = 10

[upstream]
# Per-attempt timeout in seconds. Streaming requests apply it up to the first chunk.
timeout_secs = 90

[stats]
# Day buckets are cut at midnight in this fixed offset (minutes east of UTC; 480 = UTC+8).
utc_offset_minutes = 0
history_days = 30
flush_interval_secs = 30

[logging]
buffer_capacity = 200
# file = true   # write tracing output to ~/.catfish-agg/logs/runtime.log

# --- schemes ---
#
# A scheme is selected by the caller's `model` field. Unknown models fall back to the
# first scheme below. Channels are tried by ascending priority; channels sharing a
# priority are rotated round-robin across requests.
#
# [[schemes]]
# name = "pool-a"
#
# [[schemes.channels]]
# priority = 1
# base_url = "https://api.openai.com/v1"
# api_key_env = "OPENAI_API_KEY"
# model = "gpt-4o-mini"          # optional override of the caller's model
# failure_threshold = 3          # optional; open the circuit after 3 consecutive failures
# disable_secs = 60              # optional; how long the circuit stays open
#
# [[schemes.channels]]
# priority = 2
# base_url = "https://backup.example/v1"
# api_key_env = "BACKUP_API_KEY"
"#;

pub async fn init_config_toml(force: bool) -> Result<PathBuf> {
    let dir = config_dir();
    fs::create_dir_all(&dir).await?;
    let path = config_toml_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config.toml already exists at {:?}; use --force to overwrite",
            path
        );
    }

    if path.exists()
        && let Err(err) = fs::copy(&path, dir.join("config.toml.bak")).await
    {
        warn!("failed to backup {:?}: {}", path, err);
    }

    let tmp_path = dir.join("config.toml.tmp");
    fs::write(&tmp_path, CONFIG_TOML_TEMPLATE.as_bytes()).await?;
    fs::rename(&tmp_path, &path).await?;
    Ok(path)
}

pub async fn load_config() -> Result<ProxyConfig> {
    let path = config_file_path();
    if !path.exists() {
        let mut cfg = ProxyConfig::default();
        ensure_config_version(&mut cfg);
        return Ok(cfg);
    }
    load_config_from(&path).await
}

pub async fn load_config_from(path: &Path) -> Result<ProxyConfig> {
    load_config_file(path).await.map(|(cfg, _)| cfg)
}

/// Loads and normalizes a config file. The flag is true when normalization changed anything
/// (e.g. generated channel ids) and the file should be written back.
pub async fn load_config_file(path: &Path) -> Result<(ProxyConfig, bool)> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("failed to read {:?}", path))?;
    let mut cfg = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_slice::<ProxyConfig>(&bytes)
            .with_context(|| format!("invalid JSON config {:?}", path))?
    } else {
        let text = String::from_utf8_lossy(&bytes);
        toml::from_str::<ProxyConfig>(&text)
            .with_context(|| format!("invalid TOML config {:?}", path))?
    };
    ensure_config_version(&mut cfg);
    let changed = normalize_proxy_config(&mut cfg);
    Ok((cfg, changed))
}

pub async fn save_config_to(path: &Path, cfg: &ProxyConfig) -> Result<()> {
    let mut cfg = cfg.clone();
    ensure_config_version(&mut cfg);

    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(config_dir);
    fs::create_dir_all(&dir).await?;
    let is_json = path.extension().is_some_and(|e| e == "json");
    let data = if is_json {
        serde_json::to_vec_pretty(&cfg)?
    } else {
        let body = toml::to_string_pretty(&cfg)?;
        format!("{CONFIG_TOML_DOC_HEADER}\n{body}").into_bytes()
    };

    // Back up the previous file, then write to a temp file and rename it into place.
    if path.exists() {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        if let Err(err) = fs::copy(path, PathBuf::from(&backup)).await {
            warn!("failed to backup {:?}: {}", path, err);
        }
    }

    let tmp_path = dir.join("config.tmp");
    fs::write(&tmp_path, &data).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}

/// Trims names and assigns ids to channels that have none. Returns true when anything changed.
pub fn normalize_proxy_config(cfg: &mut ProxyConfig) -> bool {
    let mut changed = false;
    for scheme in cfg.schemes.iter_mut() {
        let trimmed = scheme.name.trim();
        if trimmed.len() != scheme.name.len() {
            scheme.name = trimmed.to_string();
            changed = true;
        }
        for ch in scheme.channels.iter_mut() {
            if ch.id.trim().is_empty() {
                ch.id = uuid::Uuid::new_v4().to_string();
                changed = true;
            } else if ch.id.trim().len() != ch.id.len() {
                ch.id = ch.id.trim().to_string();
                changed = true;
            }
        }
    }
    changed
}

/// Home directory for config, stats and runtime logs.
pub fn proxy_home_dir() -> PathBuf {
    if let Ok(dir) = env::var("CATFISH_AGG_HOME") {
        let trimmed = dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    #[cfg(test)]
    {
        static TEST_HOME: std::sync::OnceLock<PathBuf> = std::sync::OnceLock::new();
        TEST_HOME
            .get_or_init(|| {
                let mut dir = std::env::temp_dir();
                let unique = format!(
                    "catfish-agg-test-{}-{}",
                    std::process::id(),
                    std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_nanos())
                        .unwrap_or(0)
                );
                dir.push(unique);
                dir.push(".catfish-agg");
                let _ = std::fs::create_dir_all(&dir);
                dir
            })
            .clone()
    }

    #[cfg(not(test))]
    {
        home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".catfish-agg")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"
admin_key = "secret"

[upstream]
timeout_secs = 5

[[schemes]]
name = "pool-a"

[[schemes.channels]]
id = "a1"
priority = 1
base_url = "http://127.0.0.1:9/v1"
api_key = "k1"
failure_threshold = 3
disable_secs = 60

[[schemes.channels]]
priority = 2
base_url = "http://127.0.0.1:9/v1"
api_key = "k2"
model = "  "

[[schemes]]
name = "pool-b"
"#;

    fn sample() -> ProxyConfig {
        let mut cfg: ProxyConfig = toml::from_str(SAMPLE).expect("parse");
        normalize_proxy_config(&mut cfg);
        cfg
    }

    #[test]
    fn parses_ordered_schemes_and_defaults() {
        let cfg = sample();
        assert_eq!(cfg.schemes.len(), 2);
        assert_eq!(cfg.schemes[0].name, "pool-a");
        assert_eq!(cfg.upstream.timeout_secs, 5);
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.logging.buffer_capacity, 200);
        assert_eq!(cfg.stats.history_days, 30);
    }

    #[test]
    fn normalize_assigns_missing_channel_ids_once() {
        let mut cfg: ProxyConfig = toml::from_str(SAMPLE).expect("parse");
        assert!(normalize_proxy_config(&mut cfg));
        let generated = cfg.schemes[0].channels[1].id.clone();
        assert!(!generated.is_empty());
        assert!(!normalize_proxy_config(&mut cfg));
        assert_eq!(cfg.schemes[0].channels[1].id, generated);
    }

    #[test]
    fn unknown_scheme_falls_back_to_first_defined() {
        let cfg = sample();
        let (scheme, fell_back) = cfg.resolve_scheme("unknown-scheme-xyz").unwrap();
        assert_eq!(scheme.name, "pool-a");
        assert!(fell_back);
        let (scheme, fell_back) = cfg.resolve_scheme("pool-b").unwrap();
        assert_eq!(scheme.name, "pool-b");
        assert!(!fell_back);
        assert!(ProxyConfig::default().resolve_scheme("x").is_none());
    }

    #[test]
    fn breaker_policy_requires_positive_threshold() {
        let cfg = sample();
        let policy = cfg.schemes[0].channels[0].breaker_policy().unwrap();
        assert_eq!(policy.threshold, 3);
        assert_eq!(policy.disable_secs, 60);
        assert!(cfg.schemes[0].channels[1].breaker_policy().is_none());

        let mut ch = cfg.schemes[0].channels[0].clone();
        ch.disable_secs = None;
        assert_eq!(
            ch.breaker_policy().unwrap().disable_secs,
            DEFAULT_DISABLE_SECS
        );
        ch.failure_threshold = Some(0);
        assert!(ch.breaker_policy().is_none());
    }

    #[test]
    fn blank_model_override_is_ignored() {
        let cfg = sample();
        assert_eq!(cfg.schemes[0].channels[1].model_override(), None);
    }

    #[test]
    fn api_key_env_is_resolved_at_call_time() {
        let mut ch = sample().schemes[0].channels[0].clone();
        ch.api_key = None;
        ch.api_key_env = Some("CATFISH_AGG_TEST_CHANNEL_KEY".to_string());
        assert_eq!(ch.resolve_api_key(), None);
        unsafe { std::env::set_var("CATFISH_AGG_TEST_CHANNEL_KEY", "sk-from-env") };
        assert_eq!(ch.resolve_api_key().as_deref(), Some("sk-from-env"));
        unsafe { std::env::remove_var("CATFISH_AGG_TEST_CHANNEL_KEY") };
    }

    #[test]
    fn warnings_flag_empty_schemes_and_duplicate_ids() {
        let mut cfg = sample();
        let dup = cfg.schemes[0].channels[0].clone();
        cfg.schemes[1].channels.push(dup);
        let warnings = config_warnings(&cfg);
        assert!(warnings.iter().any(|w| w.contains("duplicate channel id")));

        let cfg = sample();
        let warnings = config_warnings(&cfg);
        assert!(warnings.iter().any(|w| w.contains("[pool-b] scheme has no channels")));
    }

    #[tokio::test]
    async fn save_then_load_keeps_scheme_order_and_ids() {
        let cfg = sample();
        let path = proxy_home_dir().join("roundtrip").join("config.toml");
        save_config_to(&path, &cfg).await.expect("save");
        let loaded = load_config_from(&path).await.expect("load");
        let names = loaded
            .schemes
            .iter()
            .map(|s| s.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["pool-a", "pool-b"]);
        assert_eq!(loaded.channel_ids(), cfg.channel_ids());
    }
}
