//! Quota Governor - keeps a group's CPU average under a target over a
//! trailing window
//!
//! Samples host CPU usage, recomputes the group's cgroup v2 CPU limit every
//! step, and serves health, metrics and status over HTTP.

use anyhow::{Context, Result};
use governor_lib::{
    collector::{ProcStatSampler, SamplingLoop},
    control::ControlLoop,
    controller::CgroupController,
    health::HealthRegistry,
    sink::{FanoutLogSink, LogSink, MemoryLogSink, TracingLogSink, DEFAULT_LOG_CAPACITY},
    config::SettingsFile,
    store::{MemorySampleStore, SampleStore, SqliteSampleStore, DEFAULT_MAX_SAMPLES},
    ConfigStore, GovernorLogger, GovernorMetrics, GovernorSettings,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod reload;

const GOVERNOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting quota-governor");

    // Invalid window or time-slot settings abort startup here
    let config = config::GovernorConfig::load()?;
    info!(
        node_name = %config.node_name,
        cgroup_root = %config.cgroup_root.display(),
        cgroup_name = %config.cgroup_name,
        cpu_cores = config.cpu_cores,
        "Governor configured"
    );

    if config.persist {
        if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
            warn!(
                data_dir = %config.data_dir.display(),
                error = %e,
                "Failed to create data directory"
            );
        }
    }

    let settings = initial_settings(&config);
    let store = ConfigStore::new(settings).context("Invalid governor settings")?;

    let health_registry = HealthRegistry::new();
    let _metrics = GovernorMetrics::new();

    let logger = GovernorLogger::new(&config.node_name);
    let live = store.snapshot();
    logger.log_startup(
        GOVERNOR_VERSION,
        live.window.window_length_secs,
        live.window.target_average_limit_percent,
    );

    let samples = open_sample_store(&config);
    let sampling = SamplingLoop::new(
        Arc::new(ProcStatSampler::with_proc_path(&config.proc_root)),
        samples.clone(),
        config.sample_interval(),
        health_registry.clone(),
    );

    let controller = CgroupController::new(&config.cgroup_root, &config.cgroup_name)
        .with_proc_path(&config.proc_root)
        .with_cpu_cores(config.cpu_cores);

    let logs = Arc::new(MemoryLogSink::new(DEFAULT_LOG_CAPACITY));
    let sink = FanoutLogSink::new(vec![logs.clone() as Arc<dyn LogSink>])
        .with(Arc::new(TracingLogSink));

    let control = ControlLoop::builder()
        .config(store.clone())
        .sample_store(samples)
        .controller(Arc::new(controller))
        .sink(Arc::new(sink))
        .health(health_registry.clone())
        .node_name(config.node_name.clone())
        .process_sync_interval(config.process_sync_interval())
        .query_timeout(config.query_timeout())
        .shutdown_grace(config.shutdown_grace())
        .build()?;

    let app_state = Arc::new(api::AppState {
        health_registry: health_registry.clone(),
        control: control.clone(),
        config: store.clone(),
        logs,
        logger: logger.clone(),
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let sampling_handle = tokio::spawn(sampling.run(shutdown_tx.subscribe()));

    let api_port = config.api_port;
    let api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state, api_shutdown).await {
            error!(error = %e, "API server failed");
        }
    });

    let persist_handle = config.persist.then(|| {
        let settings = SettingsFile::new(config.settings_path());
        tokio::spawn(settings.persist_changes(&store, shutdown_tx.subscribe()))
    });

    let reload_handle = std::env::var_os(config::CONFIG_FILE_ENV).map(|path| {
        let reloader = reload::ConfigReloader::new(path, store.clone(), logger.clone());
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = reloader.watch(shutdown).await {
                warn!(error = %e, "Config hot reload disabled");
            }
        })
    });

    // start() runs inside run(); the controller is set up before the first cycle
    let control_handle = tokio::spawn(control.run(shutdown_tx.subscribe()));

    let reason = wait_for_signal().await?;
    info!(reason, "Shutting down");
    let _ = shutdown_tx.send(());

    let _ = control_handle.await;
    let _ = sampling_handle.await;
    let _ = api_handle.await;
    if let Some(handle) = reload_handle {
        let _ = handle.await;
    }
    if let Some(handle) = persist_handle {
        let _ = handle.await;
    }

    info!("Quota governor stopped");
    Ok(())
}

/// Live settings persisted by a previous run win over the config file;
/// a later edit of the file replaces them through hot reload.
fn initial_settings(config: &config::GovernorConfig) -> GovernorSettings {
    if !config.persist {
        return config.settings();
    }

    let file = SettingsFile::new(config.settings_path());
    match file.load() {
        Ok(Some(settings)) => {
            info!(path = %file.path().display(), "Restored persisted live settings");
            settings
        }
        Ok(None) => config.settings(),
        Err(e) => {
            warn!(error = %format!("{:#}", e), "Ignoring persisted live settings");
            config.settings()
        }
    }
}

/// SQLite history under `data_dir`, or an in-memory ring when persistence
/// is off or the database cannot be opened
fn open_sample_store(config: &config::GovernorConfig) -> Arc<dyn SampleStore> {
    if config.persist {
        match SqliteSampleStore::open(config.samples_path(), config.retention()) {
            Ok(store) => return Arc::new(store),
            Err(e) => warn!(
                error = %format!("{:#}", e),
                "Sample history will not survive a restart"
            ),
        }
    }
    Arc::new(MemorySampleStore::new(config.retention(), DEFAULT_MAX_SAMPLES))
}

/// Wait for SIGINT or SIGTERM
async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
                Ok("SIGINT received")
            }
            _ = terminate.recv() => Ok("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for SIGINT")?;
        Ok("SIGINT received")
    }
}
