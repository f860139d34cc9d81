//! Persisted live settings
//!
//! Every change accepted by the `ConfigStore` (API updates and file reloads)
//! is written to a JSON file, and read back at startup so the last live
//! window and time slots survive a restart.

use super::{ConfigStore, GovernorSettings};
use anyhow::{Context, Result};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previously persisted settings, `None` if nothing was saved yet
    pub fn load(&self) -> Result<Option<GovernorSettings>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        let settings: GovernorSettings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        settings
            .validate()
            .with_context(|| format!("Invalid settings in {}", self.path.display()))?;
        Ok(Some(settings))
    }

    /// Write `settings`, replacing the file atomically
    pub async fn save(&self, settings: &GovernorSettings) -> Result<()> {
        let json = serde_json::to_vec_pretty(settings).context("Failed to encode settings")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Persisted live settings");
        Ok(())
    }

    /// Save every settings change published by `store` after this call
    /// until `shutdown` fires
    pub fn persist_changes(
        self,
        store: &ConfigStore,
        shutdown: broadcast::Receiver<()>,
    ) -> impl Future<Output = ()> + Send + 'static {
        self.run(store.subscribe(), shutdown)
    }

    async fn run(
        self,
        mut changes: watch::Receiver<Arc<GovernorSettings>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(path = %self.path.display(), "Persisting live settings changes");

        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let settings = changes.borrow_and_update().clone();
                    if let Err(e) = self.save(&settings).await {
                        warn!(error = %format!("{:#}", e), "Failed to persist settings change");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeSlotReservation;
    use chrono::NaiveTime;
    use std::time::Duration;
    use tempfile::TempDir;

    fn slot() -> TimeSlotReservation {
        TimeSlotReservation::new(
            "nightly-backup",
            NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(1, 0, 0).unwrap(),
            40.0,
        )
    }

    #[test]
    fn test_missing_file_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(dir.path().join("settings.json"));

        assert!(file.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_saved_settings_load_back() {
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(dir.path().join("settings.json"));
        let mut settings = GovernorSettings::default();
        settings.window.target_average_limit_percent = 22.0;
        settings.time_slots.push(slot());

        file.save(&settings).await.unwrap();

        assert_eq!(file.load().unwrap(), Some(settings));
    }

    #[test]
    fn test_invalid_saved_settings_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "window": { "safety_factor": 1.5 } }"#).unwrap();

        assert!(SettingsFile::new(&path).load().is_err());
    }

    #[tokio::test]
    async fn test_store_changes_survive_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        let store = ConfigStore::new(GovernorSettings::default()).unwrap();
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(SettingsFile::new(&path).persist_changes(&store, rx));

        let mut window = store.snapshot().window.clone();
        window.window_length_secs = 3600;
        store.update_window(window).unwrap();
        store.replace_time_slots(vec![slot()]).unwrap();

        let file = SettingsFile::new(&path);
        let mut persisted = None;
        for _ in 0..50 {
            persisted = file.load().unwrap();
            if persisted.as_ref() == Some(store.snapshot().as_ref()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tx.send(()).unwrap();
        handle.await.unwrap();

        let restored = ConfigStore::new(persisted.unwrap()).unwrap().snapshot();
        assert_eq!(restored.window.window_length_secs, 3600);
        assert_eq!(restored.time_slots.len(), 1);
    }
}
