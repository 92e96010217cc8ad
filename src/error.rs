//! Custom error types for the application.
//!
//! This module defines the primary error type, `PatrolError`, and the narrower
//! per-channel errors it wraps. Each of the three unreliable links (robot
//! socket, Modbus sensor, SQL sink) gets its own enum so the component that
//! owns the link can recover from it locally; only `PatrolError` crosses the
//! run boundary.
//!
//! ## Error Hierarchy
//!
//! - **`ChannelError`**: robot command channel. `Disconnected` and `Timeout` are the
//!   recoverable transport conditions the orchestrator retries after a backoff.
//! - **`ModbusError`**: raw Modbus-TCP framing and transport failures.
//! - **`SensorError`**: a measurement cycle that produced no usable reading. Always
//!   counted as a failed attempt, never partial data.
//! - **`PersistenceError`**: the result sink refused or could not be reached. The
//!   orchestrator buffers the reading instead of failing.
//! - **`RunRejected`**: reasons a run-start request is refused.
//! - **`PatrolError`**: application-level error. Wraps all of the above via `#[from]`
//!   so `?` works across layers.
//!
//! There is no "element not found" error: a point that is not visible on the
//! robot's screen is an expected outcome and is reported as `false`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, PatrolError>;

/// Robot command channel failures.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Robot agent is not connected")]
    Disconnected,

    #[error("Robot agent did not reply within {0:?}")]
    Timeout(Duration),

    #[error("Robot channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Transport conditions that a navigation step may retry after a backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Disconnected | ChannelError::Timeout(_))
    }
}

/// Modbus-TCP wire failures.
#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("Modbus I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Modbus request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Modbus exception 0x{code:02X} for function 0x{function:02X}")]
    Exception { function: u8, code: u8 },

    #[error("Malformed Modbus response: {0}")]
    Protocol(String),
}

/// A measurement cycle that could not produce a reading.
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Sensor I/O failure: {0}")]
    Io(#[from] ModbusError),

    #[error("Sensor reports no completed measurement record")]
    NoCompletedRecord,

    #[error("Sensor returned {actual} registers, expected {expected}")]
    ShortRead { expected: usize, actual: usize },
}

/// Result sink failures.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Result sink unavailable: {0}")]
    Unavailable(String),
}

/// Reasons a run-start request is refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRejected {
    #[error("An inspection run is already in progress")]
    AlreadyRunning,

    #[error("The point queue is empty")]
    QueueEmpty,
}

/// Application-level error.
#[derive(Error, Debug)]
pub enum PatrolError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Run rejected: {0}")]
    Rejected(#[from] RunRejected),

    #[error("Inspection run aborted: {0}")]
    RunAborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PatrolError::Configuration("max_retries must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration validation error: max_retries must be at least 1"
        );
    }

    #[test]
    fn test_channel_errors_are_transparent() {
        let err: PatrolError = ChannelError::Disconnected.into();
        assert_eq!(err.to_string(), "Robot agent is not connected");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ChannelError::Disconnected.is_transient());
        assert!(ChannelError::Timeout(Duration::from_secs(1)).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(!ChannelError::Io(io).is_transient());
    }

    #[test]
    fn test_rejection_wraps() {
        let err: PatrolError = RunRejected::QueueEmpty.into();
        assert!(matches!(err, PatrolError::Rejected(RunRejected::QueueEmpty)));
        assert!(err.to_string().contains("queue is empty"));
    }

    #[test]
    fn test_sensor_error_from_modbus() {
        let err: SensorError = ModbusError::Exception {
            function: 0x04,
            code: 0x02,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Sensor I/O failure: Modbus exception 0x02 for function 0x04"
        );
    }
}
