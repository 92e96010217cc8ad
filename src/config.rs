//! Configuration System using Figment
//!
//! Strongly-typed configuration for the patrol service. Configuration is loaded from:
//! 1. `config/dust_patrol.toml` (or an explicit path)
//! 2. Environment variables prefixed with `DUST_PATROL_`, nested keys split on `__`
//!
//! Every field has a default, so a missing or empty file yields a usable
//! configuration that matches the reference installation.
//!
//! # Environment Variable Overrides
//!
//! ```text
//! DUST_PATROL_APPLICATION__LOG_LEVEL=debug
//! DUST_PATROL_SENSOR__HOST=192.168.1.115
//! DUST_PATROL_MEASUREMENT__UCL_LIMIT=120
//! ```
//!
//! # Example
//! ```no_run
//! use dust_patrol::config::Settings;
//!
//! let settings = Settings::load()?;
//! settings.validate()?;
//! println!("Robot agent port: {}", settings.robot.bind);
//! # Ok::<(), dust_patrol::error::PatrolError>(())
//! ```

use crate::error::{AppResult, PatrolError};
use crate::measurement::Channel;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/dust_patrol.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DUST_PATROL_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Robot agent command channel
    pub robot: RobotConfig,
    /// Navigation sequence sent to the robot agent
    pub navigation: NavigationConfig,
    /// Particle sensor (Modbus TCP)
    pub sensor: SensorConfig,
    /// Retry and alarm policy
    pub measurement: MeasurementConfig,
    /// Result database
    pub storage: StorageConfig,
    /// HTTP control surface
    pub api: ApiConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "dust_patrol".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Robot agent channel. The agent dials in; this side listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Listen address for the agent connection
    pub bind: String,
    /// Interval between liveness probes
    pub heartbeat_interval_ms: u64,
    /// Deadline for a `pong` reply
    pub probe_timeout_ms: u64,
    /// Deadline for a simple reply
    pub reply_timeout_ms: u64,
    /// Per-read deadline while collecting a chunked reply
    pub chunk_timeout_ms: u64,
    /// Maximum size of a simple reply
    pub reply_buffer_bytes: usize,
    /// Read size while collecting a chunked reply
    pub chunk_buffer_bytes: usize,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:12345".to_string(),
            heartbeat_interval_ms: 10_000,
            probe_timeout_ms: 3_000,
            reply_timeout_ms: 10_000,
            chunk_timeout_ms: 10_000,
            reply_buffer_bytes: 1024,
            chunk_buffer_bytes: 4096,
        }
    }
}

impl RobotConfig {
    /// `heartbeat_interval_ms` as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `probe_timeout_ms` as a duration.
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// `reply_timeout_ms` as a duration.
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Read timeout per chunk of a UI dump.
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

/// Fixed UI sequence that walks the robot app to a point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    /// Sent once at run start to return to the launcher
    pub home_command: String,
    /// Sent once at run start to open the robot app
    pub app_command: String,
    /// Sent before each point to reach the destination list
    pub menu_commands: Vec<String>,
    /// Starts the drive once a point is selected
    pub go_command: String,
    /// Label that reappears when the robot has arrived
    pub arrival_marker: String,
    /// Pause after every navigation command
    pub settle_delay_ms: u64,
    /// Pause between arrival polls
    pub arrival_poll_interval_ms: u64,
    /// Arrival polls before giving up and measuring anyway
    pub arrival_max_polls: u32,
    /// Scroll steps per direction when searching for a point
    pub scroll_cap: u32,
    /// Overall deadline for one navigation step, reconnect waits included
    pub step_timeout_ms: u64,
    /// Pause between attempts while the agent is disconnected
    pub reconnect_backoff_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            home_command: "goHome".to_string(),
            app_command: "Peanut".to_string(),
            menu_commands: vec!["clickBackButton".to_string(), "Direct".to_string()],
            go_command: "Go".to_string(),
            arrival_marker: "Go".to_string(),
            settle_delay_ms: 2_000,
            arrival_poll_interval_ms: 1_000,
            arrival_max_polls: 120,
            scroll_cap: 10,
            step_timeout_ms: 60_000,
            reconnect_backoff_ms: 12_000,
        }
    }
}

impl NavigationConfig {
    /// `settle_delay_ms` as a duration.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// `arrival_poll_interval_ms` as a duration.
    pub fn arrival_poll_interval(&self) -> Duration {
        Duration::from_millis(self.arrival_poll_interval_ms)
    }

    /// `step_timeout_ms` as a duration.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    /// Pause before retrying a command after a disconnect.
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

/// Particle counter reachable over Modbus TCP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Sensor host name or IP
    pub host: String,
    /// Modbus TCP port
    pub port: u16,
    /// Modbus unit (slave) identifier
    pub unit_id: u8,
    /// Integration time between start and stop
    pub dwell_secs: u64,
    /// Deadline for connect and for each Modbus transaction
    pub io_timeout_ms: u64,
    /// Room recorded with every reading
    pub room: String,
    /// Area recorded with every reading
    pub area: String,
    /// Channel compared against the UCL
    pub primary_channel: Channel,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.115".to_string(),
            port: 502,
            unit_id: 1,
            dwell_secs: 70,
            io_timeout_ms: 3_000,
            room: "CR11".to_string(),
            area: "1K".to_string(),
            primary_channel: Channel::Um05,
        }
    }
}

impl SensorConfig {
    /// `host:port` for the Modbus gateway.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sampling time per cycle.
    pub fn dwell(&self) -> Duration {
        Duration::from_secs(self.dwell_secs)
    }

    /// `io_timeout_ms` as a duration.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Retry and alarm policy for one point.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
    /// Attempts per point, counting from 1
    pub max_retries: u32,
    /// Upper control limit for the primary channel
    pub ucl_limit: u32,
    /// Pause between attempts
    pub retry_delay_ms: u64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            ucl_limit: 100,
            retry_delay_ms: 2_000,
        }
    }
}

impl MeasurementConfig {
    /// `retry_delay_ms` as a duration.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Result database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// sqlx connection URL
    pub database_url: String,
    /// Pool size
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:dust_measurements.db?mode=rwc".to_string(),
            max_connections: 1,
        }
    }
}

/// HTTP control surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

impl Settings {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PatrolError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(PatrolError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.robot.heartbeat_interval_ms == 0 {
            return Err(PatrolError::Configuration(
                "robot.heartbeat_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.robot.reply_buffer_bytes == 0 || self.robot.chunk_buffer_bytes == 0 {
            return Err(PatrolError::Configuration(
                "robot reply buffers must be non-empty".to_string(),
            ));
        }

        if self.navigation.scroll_cap == 0 {
            return Err(PatrolError::Configuration(
                "navigation.scroll_cap must be at least 1".to_string(),
            ));
        }

        if self.navigation.arrival_marker.trim().is_empty() {
            return Err(PatrolError::Configuration(
                "navigation.arrival_marker must not be empty".to_string(),
            ));
        }

        if self.sensor.host.trim().is_empty() {
            return Err(PatrolError::Configuration(
                "sensor.host must not be empty".to_string(),
            ));
        }

        if self.measurement.max_retries == 0 {
            return Err(PatrolError::Configuration(
                "measurement.max_retries must be at least 1".to_string(),
            ));
        }

        if self.storage.max_connections == 0 {
            return Err(PatrolError::Configuration(
                "storage.max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.navigation.scroll_cap, 10);
        assert_eq!(settings.navigation.arrival_max_polls, 120);
        assert_eq!(settings.measurement.ucl_limit, 100);
        assert_eq!(settings.sensor.primary_channel, Channel::Um05);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let settings = Settings::load_from("does-not-exist.toml")
                .map_err(|e| e.to_string())?;
            assert_eq!(settings.robot.bind, "0.0.0.0:12345");
            Ok(())
        });
    }

    #[test]
    fn test_file_and_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "patrol.toml",
                r#"
                [sensor]
                host = "10.1.2.3"
                dwell_secs = 30

                [measurement]
                max_retries = 5
                "#,
            )?;
            jail.set_env("DUST_PATROL_MEASUREMENT__UCL_LIMIT", "150");
            jail.set_env("DUST_PATROL_SENSOR__PRIMARY_CHANNEL", "um03");

            let settings = Settings::load_from("patrol.toml").map_err(|e| e.to_string())?;
            assert_eq!(settings.sensor.host, "10.1.2.3");
            assert_eq!(settings.sensor.dwell(), Duration::from_secs(30));
            assert_eq!(settings.sensor.port, 502);
            assert_eq!(settings.measurement.max_retries, 5);
            assert_eq!(settings.measurement.ucl_limit, 150);
            assert_eq!(settings.sensor.primary_channel, Channel::Um03);
            Ok(())
        });
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut settings = Settings::default();
        settings.measurement.max_retries = 0;
        assert!(matches!(
            settings.validate(),
            Err(PatrolError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_scroll_cap_rejected() {
        let mut settings = Settings::default();
        settings.navigation.scroll_cap = 0;
        assert!(settings.validate().is_err());
    }
}
