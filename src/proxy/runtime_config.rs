use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{info, warn};

use crate::config::{ProxyConfig, load_config_file, save_config_to};
use crate::error::ProxyError;

const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(800);

/// The live scheme registry: an immutable snapshot swapped as a whole on reload or admin edits.
pub struct RuntimeConfig {
    current: AsyncRwLock<Arc<ProxyConfig>>,
    /// Backing file. `None` keeps the config purely in memory (no reload, no write-through).
    source: Option<PathBuf>,
    reload: AsyncMutex<RuntimeConfigReloadState>,
    /// Serializes admin edits so two writers never clobber each other's changes.
    edit: AsyncMutex<()>,
}

#[derive(Debug)]
struct RuntimeConfigReloadState {
    last_check_at: Instant,
    last_mtime: Option<SystemTime>,
}

async fn file_mtime(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
}

impl RuntimeConfig {
    pub fn new(initial: Arc<ProxyConfig>, source: Option<PathBuf>) -> Self {
        Self {
            current: AsyncRwLock::new(initial),
            source,
            reload: AsyncMutex::new(RuntimeConfigReloadState {
                last_check_at: Instant::now()
                    .checked_sub(Duration::from_secs(60))
                    .unwrap_or_else(Instant::now),
                last_mtime: None,
            }),
            edit: AsyncMutex::new(()),
        }
    }

    /// Records the current mtime of the backing file so an unchanged file is not reloaded.
    pub async fn prime(&self) {
        if let Some(path) = self.source.as_deref() {
            let mtime = file_mtime(path).await;
            self.reload.lock().await.last_mtime = mtime;
        }
    }

    pub async fn snapshot(&self) -> Arc<ProxyConfig> {
        self.current.read().await.clone()
    }

    /// Checks the backing file at most every 800ms. Returns the new snapshot when one was
    /// installed.
    pub async fn maybe_reload_from_disk(&self) -> Option<Arc<ProxyConfig>> {
        let path = self.source.as_deref()?;
        let last_mtime = {
            let mut st = self.reload.lock().await;
            if st.last_check_at.elapsed() < MIN_CHECK_INTERVAL {
                return None;
            }
            st.last_check_at = Instant::now();
            st.last_mtime
        };

        let mtime = file_mtime(path).await;
        if mtime.is_none() || mtime == last_mtime {
            return None;
        }

        let installed = match self.load_and_install(path).await {
            Ok(cfg) => Some(cfg),
            Err(err) => {
                warn!("failed to reload config from disk: {:#}", err);
                None
            }
        };

        let mut st = self.reload.lock().await;
        st.last_mtime = file_mtime(path).await.or(mtime);
        installed
    }

    /// Reloads the backing file unconditionally.
    pub async fn force_reload(&self) -> Result<Arc<ProxyConfig>, ProxyError> {
        let Some(path) = self.source.as_deref() else {
            return Ok(self.snapshot().await);
        };
        let cfg = self.load_and_install(path).await?;
        self.reload.lock().await.last_mtime = file_mtime(path).await;
        Ok(cfg)
    }

    async fn load_and_install(&self, path: &Path) -> anyhow::Result<Arc<ProxyConfig>> {
        let _edit = self.edit.lock().await;
        let (cfg, changed) = load_config_file(path).await?;
        if changed {
            // Generated channel ids must survive the next reload.
            save_config_to(path, &cfg)
                .await
                .with_context(|| format!("failed to persist normalized config {:?}", path))?;
        }
        let cfg = Arc::new(cfg);
        *self.current.write().await = cfg.clone();
        info!(
            "config reloaded: {} scheme(s), {} channel(s)",
            cfg.schemes.len(),
            cfg.channel_count()
        );
        Ok(cfg)
    }

    /// Applies `edit` to a copy of the current config, writes it through to the backing file and
    /// installs it. Nothing changes if `edit` or the write fails.
    pub async fn update<T>(
        &self,
        edit: impl FnOnce(&mut ProxyConfig) -> Result<T, ProxyError>,
    ) -> Result<(Arc<ProxyConfig>, T), ProxyError> {
        let _edit = self.edit.lock().await;
        let mut next = (*self.snapshot().await).clone();
        let out = edit(&mut next)?;

        if let Some(path) = self.source.as_deref() {
            save_config_to(path, &next)
                .await
                .with_context(|| format!("failed to write config {:?}", path))?;
            self.reload.lock().await.last_mtime = file_mtime(path).await;
        }
        let next = Arc::new(next);
        *self.current.write().await = next.clone();
        Ok((next, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SchemeConfig, proxy_home_dir};
    use pretty_assertions::assert_eq;

    fn scheme(name: &str) -> SchemeConfig {
        SchemeConfig {
            name: name.to_string(),
            channels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn in_memory_config_never_reloads() {
        let rc = RuntimeConfig::new(Arc::new(ProxyConfig::default()), None);
        assert!(rc.maybe_reload_from_disk().await.is_none());
        let (cfg, ()) = rc
            .update(|c| {
                c.schemes.push(scheme("pool-a"));
                Ok(())
            })
            .await
            .expect("update");
        assert_eq!(cfg.schemes.len(), 1);
        assert_eq!(rc.snapshot().await.schemes[0].name, "pool-a");
    }

    #[tokio::test]
    async fn failed_edit_leaves_snapshot_untouched() {
        let rc = RuntimeConfig::new(Arc::new(ProxyConfig::default()), None);
        let res: Result<(Arc<ProxyConfig>, ()), ProxyError> = rc
            .update(|c| {
                c.schemes.push(scheme("pool-a"));
                Err(ProxyError::ChannelNotFound("x".to_string()))
            })
            .await;
        assert!(res.is_err());
        assert!(rc.snapshot().await.schemes.is_empty());
    }

    #[tokio::test]
    async fn picks_up_file_changes_and_writes_through() {
        let dir = proxy_home_dir().join("runtime-config");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("config.toml");
        tokio::fs::write(
            &path,
            "[[schemes]]\nname = \"pool-a\"\n\n[[schemes.channels]]\nbase_url = \"http://127.0.0.1:9/v1\"\n",
        )
        .await
        .unwrap();

        let rc = RuntimeConfig::new(Arc::new(ProxyConfig::default()), Some(path.clone()));
        let cfg = rc.maybe_reload_from_disk().await.expect("reloaded");
        assert_eq!(cfg.schemes[0].name, "pool-a");
        let id = cfg.schemes[0].channels[0].id.clone();
        assert!(!id.is_empty());

        // The generated id was persisted, so a forced reload keeps it.
        let again = rc.force_reload().await.expect("reload");
        assert_eq!(again.schemes[0].channels[0].id, id);

        rc.update(|c| {
            c.schemes.push(scheme("pool-b"));
            Ok(())
        })
        .await
        .expect("update");
        let on_disk = crate::config::load_config_from(&path).await.unwrap();
        assert_eq!(on_disk.schemes.len(), 2);
    }
}
