//! Copy-on-read configuration store
//!
//! Readers take an `Arc` snapshot; writers validate and swap the whole
//! snapshot, so a cycle never observes a half-applied update.

use super::{ConfigError, GovernorSettings, TimeSlotReservation, WindowConfig};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared handle to the current governor settings
#[derive(Debug, Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<Arc<GovernorSettings>>>,
}

impl ConfigStore {
    /// Create a store holding validated initial settings
    pub fn new(settings: GovernorSettings) -> Result<Self, ConfigError> {
        settings.validate()?;
        let (tx, _rx) = watch::channel(Arc::new(settings));
        Ok(Self { tx: Arc::new(tx) })
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<GovernorSettings> {
        self.tx.borrow().clone()
    }

    /// Receive a notification whenever the snapshot is replaced
    pub fn subscribe(&self) -> watch::Receiver<Arc<GovernorSettings>> {
        self.tx.subscribe()
    }

    /// Replace the whole snapshot
    pub fn replace(&self, settings: GovernorSettings) -> Result<(), ConfigError> {
        self.modify(|_| Ok(settings))
    }

    /// Replace the window configuration, keeping the time slots
    pub fn update_window(&self, window: WindowConfig) -> Result<(), ConfigError> {
        self.modify(|current| {
            Ok(GovernorSettings {
                window,
                time_slots: current.time_slots.clone(),
            })
        })
    }

    /// Overlay the fields present in `patch` onto the current window
    /// configuration; absent fields keep their current values
    pub fn patch_window(&self, patch: &serde_json::Value) -> Result<(), ConfigError> {
        let fields = patch
            .as_object()
            .ok_or_else(|| ConfigError::InvalidPatch("expected a JSON object".to_string()))?;

        self.modify(|current| {
            let mut merged = serde_json::to_value(&current.window)
                .map_err(|e| ConfigError::InvalidPatch(e.to_string()))?;
            let Some(target) = merged.as_object_mut() else {
                return Err(ConfigError::InvalidPatch("window is not an object".to_string()));
            };
            for (key, value) in fields {
                if !target.contains_key(key) {
                    return Err(ConfigError::InvalidPatch(format!("unknown field '{}'", key)));
                }
                target.insert(key.clone(), value.clone());
            }

            let window: WindowConfig = serde_json::from_value(merged)
                .map_err(|e| ConfigError::InvalidPatch(e.to_string()))?;
            Ok(GovernorSettings {
                window,
                time_slots: current.time_slots.clone(),
            })
        })
    }

    /// Replace the time-slot set, keeping the window configuration
    pub fn replace_time_slots(&self, time_slots: Vec<TimeSlotReservation>) -> Result<(), ConfigError> {
        self.modify(|current| {
            Ok(GovernorSettings {
                window: current.window.clone(),
                time_slots,
            })
        })
    }

    /// Build, validate and swap in new settings under the channel's write
    /// lock, so concurrent updates never overwrite each other
    fn modify<F>(&self, build: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&GovernorSettings) -> Result<GovernorSettings, ConfigError>,
    {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            let next = build(current).and_then(|next| next.validate().map(|()| next));
            match next {
                Ok(settings) => {
                    info!(
                        event = "config_updated",
                        window_secs = settings.window.window_length_secs,
                        step_secs = settings.window.step_length_secs,
                        target_percent = settings.window.target_average_limit_percent,
                        time_slots = settings.time_slots.len(),
                        "Governor configuration updated"
                    );
                    *current = Arc::new(settings);
                    true
                }
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_invalid_settings() {
        let settings = GovernorSettings {
            window: WindowConfig {
                max_load_percent: 120.0,
                ..Default::default()
            },
            time_slots: vec![],
        };
        assert!(ConfigStore::new(settings).is_err());
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_updates() {
        let store = ConfigStore::new(GovernorSettings::default()).unwrap();
        let before = store.snapshot();

        store
            .update_window(WindowConfig {
                target_average_limit_percent: 25.0,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(before.window.target_average_limit_percent, 30.0);
        assert_eq!(store.snapshot().window.target_average_limit_percent, 25.0);
    }

    #[test]
    fn test_invalid_update_keeps_previous_snapshot() {
        let store = ConfigStore::new(GovernorSettings::default()).unwrap();

        let result = store.update_window(WindowConfig {
            safety_factor: 0.0,
            ..Default::default()
        });

        assert!(result.is_err());
        assert_eq!(store.snapshot().window, WindowConfig::default());
    }

    #[tokio::test]
    async fn test_subscribers_see_replacement() {
        let store = ConfigStore::new(GovernorSettings::default()).unwrap();
        let mut rx = store.subscribe();

        store.replace_time_slots(vec![]).unwrap();

        rx.changed().await.unwrap();
        assert!(rx.borrow().time_slots.is_empty());
    }

    #[test]
    fn test_patch_window_keeps_unspecified_fields() {
        let store = ConfigStore::new(GovernorSettings::default()).unwrap();
        store
            .patch_window(&serde_json::json!({ "window_length_secs": 3600 }))
            .unwrap();

        store
            .patch_window(&serde_json::json!({ "max_load_percent": 50.0 }))
            .unwrap();

        let window = &store.snapshot().window;
        assert_eq!(window.window_length_secs, 3600);
        assert_eq!(window.max_load_percent, 50.0);
        assert_eq!(window.min_load_percent, 10.0);
    }

    #[test]
    fn test_patch_window_rejects_unknown_and_invalid_fields() {
        let store = ConfigStore::new(GovernorSettings::default()).unwrap();

        let unknown = store.patch_window(&serde_json::json!({ "window_len": 60 }));
        assert!(matches!(unknown, Err(ConfigError::InvalidPatch(_))));

        let wrong_type = store.patch_window(&serde_json::json!({ "safety_factor": "high" }));
        assert!(matches!(wrong_type, Err(ConfigError::InvalidPatch(_))));

        let not_object = store.patch_window(&serde_json::json!([1, 2]));
        assert!(matches!(not_object, Err(ConfigError::InvalidPatch(_))));

        assert_eq!(store.snapshot().window, WindowConfig::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_window_and_time_slot_updates_both_land() {
        use chrono::NaiveTime;
        use std::sync::Barrier;

        for round in 0..50 {
            let store = ConfigStore::new(GovernorSettings::default()).unwrap();
            let barrier = Arc::new(Barrier::new(2));

            let window_update = {
                let (store, barrier) = (store.clone(), barrier.clone());
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    store.update_window(WindowConfig {
                        target_average_limit_percent: 25.0,
                        ..Default::default()
                    })
                })
            };
            let slot_update = {
                let (store, barrier) = (store.clone(), barrier.clone());
                tokio::task::spawn_blocking(move || {
                    barrier.wait();
                    store.replace_time_slots(vec![TimeSlotReservation::new(
                        "batch",
                        NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                        NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
                        20.0,
                    )])
                })
            };
            window_update.await.unwrap().unwrap();
            slot_update.await.unwrap().unwrap();

            let settings = store.snapshot();
            assert_eq!(
                settings.window.target_average_limit_percent, 25.0,
                "window update lost in round {}",
                round
            );
            assert_eq!(settings.time_slots.len(), 1, "time slots lost in round {}", round);
        }
    }
}
