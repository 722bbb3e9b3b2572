//! Live configuration: a shared snapshot swapped in place on file change.
//!
//! Readers take an `Arc<AppConfig>` snapshot per query and never wait on the
//! writer. A reload that fails to parse or validate leaves the previous
//! snapshot in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gapwise_shared::{AppConfig, Result, load_config_from};

/// Cloneable handle to the current configuration snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<AppConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    /// The configuration in effect right now.
    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every successful swap.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AppConfig>> {
        self.tx.subscribe()
    }

    /// Validate and install `config`.
    pub fn replace(&self, config: AppConfig) -> Result<()> {
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }

    /// Load `path` and install it if it differs from the current snapshot.
    /// Returns whether the snapshot changed.
    pub fn reload_from(&self, path: &Path) -> Result<bool> {
        let config = load_config_from(path)?;
        if *self.snapshot() == config {
            return Ok(false);
        }
        self.tx.send_replace(Arc::new(config));
        Ok(true)
    }

    /// Poll `path`'s mtime every `interval` and reload when it moves.
    pub fn watch_file(&self, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut last_seen = modified(&path).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let current = modified(&path).await;
                if current.is_none() || current == last_seen {
                    continue;
                }
                last_seen = current;

                match handle.reload_from(&path) {
                    Ok(true) => info!(path = %path.display(), "configuration reloaded"),
                    Ok(false) => debug!(path = %path.display(), "config file touched, no changes"),
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "config reload rejected, keeping previous settings"
                    ),
                }
            }
        })
    }
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config(contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("gw_reload_{}.toml", uuid::Uuid::now_v7()));
        std::fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn replace_rejects_invalid_config() {
        let handle = ConfigHandle::new(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.confidence.weights.clarity = 0.9;
        assert!(handle.replace(bad).is_err());
        assert_eq!(*handle.snapshot(), AppConfig::default());
    }

    #[test]
    fn reload_keeps_old_snapshot_on_error() {
        let path = temp_config("[coverage]\nstrong_min_atoms = 5\n");
        let handle = ConfigHandle::new(AppConfig::default());
        let before = handle.snapshot();

        assert!(handle.reload_from(&path).unwrap());
        assert_eq!(handle.snapshot().coverage.strong_min_atoms, 5);
        assert_eq!(before.coverage.strong_min_atoms, 3);
        assert!(!handle.reload_from(&path).unwrap());

        std::fs::write(&path, "[coverage\nbroken").unwrap();
        assert!(handle.reload_from(&path).is_err());
        assert_eq!(handle.snapshot().coverage.strong_min_atoms, 5);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn watcher_swaps_snapshot_on_change() {
        let path = temp_config("[coverage]\nstrong_min_atoms = 3\n");
        let handle = ConfigHandle::new(load_config_from(&path).unwrap());
        let mut rx = handle.subscribe();
        let watcher = handle.watch_file(path.clone(), Duration::from_millis(20));

        // Let the watcher record the initial mtime before rewriting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, "[coverage]\nstrong_min_atoms = 4\n").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5)).unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("reload within timeout")
            .unwrap();
        assert_eq!(handle.snapshot().coverage.strong_min_atoms, 4);

        watcher.abort();
        let _ = std::fs::remove_file(&path);
    }
}
