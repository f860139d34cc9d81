//! Config file hot reload
//!
//! Watches the config file's directory (editors often replace the file
//! rather than write it in place) and pushes each valid edit into the
//! `ConfigStore`. Only the window and time slots are live; other fields
//! take effect on restart.

use crate::config::GovernorConfig;
use anyhow::{Context, Result};
use governor_lib::{ConfigStore, GovernorLogger};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Quiet period after the last file event before reloading
const DEBOUNCE: Duration = Duration::from_millis(250);

pub struct ConfigReloader {
    path: PathBuf,
    store: ConfigStore,
    logger: GovernorLogger,
}

impl ConfigReloader {
    pub fn new(path: impl Into<PathBuf>, store: ConfigStore, logger: GovernorLogger) -> Self {
        Self {
            path: path.into(),
            store,
            logger,
        }
    }

    /// Re-read the file and replace the live settings. On error the
    /// previous settings stay in force.
    pub fn reload(&self) -> Result<()> {
        let source = self.path.display().to_string();
        let result = GovernorConfig::load_from(Some(&self.path)).and_then(|config| {
            self.store
                .replace(config.settings())
                .context("Rejected window or time-slot configuration")
        });

        match &result {
            Ok(()) => self.logger.log_config_reload(&source, None),
            Err(e) => self.logger.log_config_reload(&source, Some(&format!("{:#}", e))),
        }
        result
    }

    /// Watch the file until `shutdown` fires
    pub async fn watch(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create config file watcher")?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;
        info!(path = %self.path.display(), "Watching config file for changes");

        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!("Config watcher channel closed");
                        break;
                    };
                    if !is_config_event(&event, &self.path) {
                        continue;
                    }

                    // editors emit bursts; wait for them to settle
                    tokio::time::sleep(DEBOUNCE).await;
                    while rx.try_recv().is_ok() {}

                    if let Err(e) = self.reload() {
                        warn!(error = %e, "Config reload failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Stopping config file watcher");
                    break;
                }
            }
        }

        drop(watcher);
        Ok(())
    }
}

/// Whether `event` touches the config file with a content change
fn is_config_event(event: &Event, path: &Path) -> bool {
    let relevant_kind = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );
    let file_name = path.file_name();
    relevant_kind
        && event
            .paths
            .iter()
            .any(|p| p == path || (file_name.is_some() && p.file_name() == file_name))
}
