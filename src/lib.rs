//! # dust_patrol
//!
//! Unattended cleanroom inspection. A UI-automation agent on the robot's
//! tablet is driven over a line-based socket protocol to walk the robot
//! between points; at each point a particle counter is read over Modbus TCP
//! with bounded retries, and every reading is persisted or buffered.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based `Settings` (TOML file plus `DUST_PATROL_` environment overrides).
//! - **`error`**: the `PatrolError` taxonomy and per-link error enums.
//! - **`error_recovery`**: bounded retry of robot steps through disconnects.
//! - **`robot`**: wire protocol, the `CommandChannel` server and the scroll-and-search `UiLocator`.
//! - **`sensor`**: Modbus-TCP client and the `SensorSession` measurement cycle.
//! - **`measurement`**: `Reading` and the UCL retry policy (`MeasurementRetrier`).
//! - **`persistence`**: `ResultSink`, the SQLite sink and the `OfflineBuffer`.
//! - **`inspection`**: point queue, single-flight run state and the `InspectionOrchestrator`.
//! - **`service`**: the operator control surface (`PatrolService`).
//! - **`api`**: axum HTTP routes over the service (feature `http_api`).
//! - **`mock`**: in-process robot, sensor and sink doubles.
//! - **`tracing_setup`**: tracing-subscriber initialisation.

#[cfg(feature = "http_api")]
pub mod api;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod inspection;
pub mod measurement;
pub mod mock;
pub mod persistence;
pub mod robot;
pub mod sensor;
pub mod service;
pub mod tracing_setup;

pub use error::{AppResult, PatrolError};
