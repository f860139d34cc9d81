//! Core library for the CPU quota governor
//!
//! This crate provides the core functionality for:
//! - Windowed CPU usage statistics over a trailing window
//! - Limit decisions (look-ahead and remaining-quota fallback)
//! - Time-slot reservations withheld from the dynamic quota
//! - cgroup v2 enforcement with monitor-only degradation
//! - The adjustment and process-sync control loop
//! - Health checks and observability

pub mod collector;
pub mod config;
pub mod control;
pub mod controller;
pub mod engine;
pub mod health;
pub mod models;
pub mod observability;
pub mod reservation;
pub mod sink;
pub mod store;
pub mod window;

pub use config::{ConfigError, ConfigStore, GovernorSettings};
pub use controller::{ControllerError, ResourceController};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{GovernorLogger, GovernorMetrics};
