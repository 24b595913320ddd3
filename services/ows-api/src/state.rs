//! Application state and configuration hot-reload.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tracing::{error, info};

use ows_common::config::{load_config_map, Config, ConfigMap};
use ows_common::error::OwsResult;

/// Shared application state. The configuration map is replaced wholesale by
/// the watcher; handlers capture a snapshot at request entry and retain it
/// for the request's life.
pub struct AppState {
    configs: RwLock<Arc<ConfigMap>>,
    pub http: reqwest::Client,
    pub data_dir: PathBuf,
    pub conf_dir: PathBuf,
    pub verbose: bool,
}

impl AppState {
    pub fn new(data_dir: PathBuf, conf_dir: PathBuf, verbose: bool) -> OwsResult<Self> {
        let configs = load_config_map(&conf_dir)?;
        Ok(Self {
            configs: RwLock::new(Arc::new(configs)),
            http: reqwest::Client::new(),
            data_dir,
            conf_dir,
            verbose,
        })
    }

    /// Snapshot the configuration for one namespace.
    pub async fn namespace_config(&self, namespace: &str) -> Option<Arc<Config>> {
        self.configs.read().await.get(namespace).cloned()
    }

    /// Reload every namespace configuration and publish the new map.
    pub async fn reload(&self) -> OwsResult<()> {
        let map = load_config_map(&self.conf_dir)?;
        *self.configs.write().await = Arc::new(map);
        Ok(())
    }
}

/// Most recent mtime across the config files under `conf_dir`.
fn latest_mtime(conf_dir: &Path) -> Option<SystemTime> {
    let mut latest: Option<SystemTime> = None;
    let mut consider = |path: &Path| {
        if let Ok(meta) = std::fs::metadata(path) {
            if let Ok(mtime) = meta.modified() {
                latest = Some(latest.map_or(mtime, |l| l.max(mtime)));
            }
        }
    };

    consider(&conf_dir.join("config.json"));
    if let Ok(entries) = std::fs::read_dir(conf_dir) {
        for entry in entries.flatten() {
            let nested = entry.path().join("config.json");
            if nested.is_file() {
                consider(&nested);
            }
        }
    }
    latest
}

/// Watch the config directory and republish the map when files change.
pub fn spawn_config_watcher(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut seen = latest_mtime(&state.conf_dir);
        loop {
            tokio::time::sleep(interval).await;
            let current = latest_mtime(&state.conf_dir);
            if current != seen {
                info!(conf_dir = %state.conf_dir.display(), "config change detected, reloading");
                match state.reload().await {
                    Ok(()) => seen = current,
                    Err(e) => error!(error = %e, "config reload failed, keeping previous map"),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_conf(dir: &Path, layer: &str) {
        std::fs::write(
            dir.join("config.json"),
            format!(r#"{{"layers": [{{"name": "{}"}}]}}"#, layer),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        write_conf(dir.path(), "first");

        let state = AppState::new(dir.path().to_path_buf(), dir.path().to_path_buf(), false)
            .unwrap();
        let conf = state.namespace_config(".").await.unwrap();
        assert_eq!(conf.layers[0].name, "first");
        assert_eq!(conf.service_config.namespace, ".");
        assert!(state.namespace_config("nope").await.is_none());

        write_conf(dir.path(), "second");
        state.reload().await.unwrap();

        // The old snapshot is untouched; a fresh one sees the new map.
        assert_eq!(conf.layers[0].name, "first");
        let fresh = state.namespace_config(".").await.unwrap();
        assert_eq!(fresh.layers[0].name, "second");
    }

    #[test]
    fn test_latest_mtime_tracks_nested_configs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(latest_mtime(dir.path()).is_none());
        write_conf(dir.path(), "x");
        assert!(latest_mtime(dir.path()).is_some());
    }
}
