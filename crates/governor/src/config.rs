//! Governor configuration
//!
//! Loaded from an optional file named by `GOVERNOR_CONFIG_FILE` and
//! overlaid by `GOVERNOR_*` environment variables. Nested keys use `__`,
//! e.g. `GOVERNOR_WINDOW__TARGET_AVERAGE_LIMIT_PERCENT=25`.

use anyhow::{ensure, Context, Result};
use governor_lib::config::{GovernorSettings, TimeSlotReservation, WindowConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_FILE_ENV: &str = "GOVERNOR_CONFIG_FILE";

/// Governor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GovernorConfig {
    /// Node name reported in logs
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics/status
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// cgroup v2 mount point
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Name of the governed group under `cgroup_root`
    #[serde(default = "default_cgroup_name")]
    pub cgroup_name: String,

    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Cores a 100% limit stands for. The default of 1 keeps
    /// `quota / period` equal to `percent / 100`.
    #[serde(default = "default_cpu_cores")]
    pub cpu_cores: u32,

    /// Host sampling interval in seconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,

    /// Process membership pass interval in seconds
    #[serde(default = "default_process_sync_interval")]
    pub process_sync_interval_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// How long host samples are kept
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Keep samples and live settings under `data_dir` across restarts
    #[serde(default = "default_persist")]
    pub persist: bool,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub window: WindowConfig,

    #[serde(default)]
    pub time_slots: Vec<TimeSlotReservation>,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}

fn default_cgroup_name() -> String {
    "quota-governor".to_string()
}

fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}

fn default_cpu_cores() -> u32 {
    1
}

fn default_sample_interval() -> u64 {
    10
}

fn default_process_sync_interval() -> u64 {
    60
}

fn default_query_timeout() -> u64 {
    2000
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_retention_hours() -> u64 {
    25
}

fn default_persist() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/quota-governor")
}

impl GovernorConfig {
    /// Load configuration from the environment and the optional config file
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_FILE_ENV).map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    /// Load configuration from `file` (if any) overlaid by the environment
    pub fn load_from(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("GOVERNOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read governor configuration")?;

        let config: GovernorConfig = config
            .try_deserialize()
            .context("Failed to parse governor configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.cgroup_name.trim_matches('/').is_empty(), "cgroup_name must not be empty");
        ensure!(self.cpu_cores > 0, "cpu_cores must be greater than zero");
        ensure!(self.sample_interval_secs > 0, "sample_interval_secs must be greater than zero");
        ensure!(
            self.process_sync_interval_secs > 0,
            "process_sync_interval_secs must be greater than zero"
        );
        ensure!(self.query_timeout_ms > 0, "query_timeout_ms must be greater than zero");
        ensure!(self.retention_hours > 0, "retention_hours must be greater than zero");

        let settings = self.settings();
        settings
            .validate()
            .context("Invalid window or time-slot configuration")?;

        let window = self.retention_hours.saturating_mul(3600);
        ensure!(
            window >= settings.window.window_length_secs,
            "retention_hours ({}) is shorter than the window ({}s)",
            self.retention_hours,
            settings.window.window_length_secs
        );
        Ok(())
    }

    /// The part of the configuration the control loop reads every cycle
    pub fn settings(&self) -> GovernorSettings {
        GovernorSettings {
            window: self.window.clone(),
            time_slots: self.time_slots.clone(),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn process_sync_interval(&self) -> Duration {
        Duration::from_secs(self.process_sync_interval_secs)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours.saturating_mul(3600))
    }

    pub fn samples_path(&self) -> PathBuf {
        self.data_dir.join("samples.db")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join("settings.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(extension: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(extension)
            .tempfile()
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = GovernorConfig::load_from(None).unwrap();

        assert_eq!(config.cgroup_name, "quota-governor");
        assert_eq!(config.cpu_cores, 1);
        assert_eq!(config.process_sync_interval(), Duration::from_secs(60));
        assert_eq!(config.settings(), GovernorSettings::default());
        assert!(config.persist);
        assert_eq!(
            config.samples_path(),
            PathBuf::from("/var/lib/quota-governor/samples.db")
        );
    }

    #[test]
    fn test_loads_window_and_time_slots_from_file() {
        let file = write_config(
            ".toml",
            r#"
api_port = 9100
cpu_cores = 4
data_dir = "/srv/governor"

[window]
window_length_secs = 3600
step_length_secs = 60
target_average_limit_percent = 25.0

[[time_slots]]
name = "nightly-backup"
start = "23:30"
end = "01:00"
required_load_percent = 40.0
"#,
        );

        let config = GovernorConfig::load_from(Some(file.path())).unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.cpu_cores, 4);
        assert_eq!(config.settings_path(), PathBuf::from("/srv/governor/settings.json"));
        assert_eq!(config.window.window_length_secs, 3600);
        assert_eq!(config.window.target_average_limit_percent, 25.0);
        // unspecified window fields keep their defaults
        assert_eq!(config.window.min_load_percent, 10.0);
        assert_eq!(config.time_slots.len(), 1);
        assert_eq!(config.time_slots[0].name, "nightly-backup");
        assert!(config.time_slots[0].enabled);
    }

    #[test]
    fn test_invalid_window_aborts_loading() {
        let file = write_config(
            ".json",
            r#"{ "window": { "min_load_percent": 50.0, "max_load_percent": 20.0 } }"#,
        );

        let err = GovernorConfig::load_from(Some(file.path())).unwrap_err();
        assert!(format!("{:#}", err).contains("load bounds"));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = GovernorConfig::load_from(Some(Path::new("/nonexistent/governor.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn test_retention_must_cover_window() {
        let file = write_config(
            ".toml",
            "retention_hours = 1\n[window]\nwindow_length_secs = 86400\n",
        );

        let err = GovernorConfig::load_from(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("retention_hours"));
    }
}
