//! Configuration system using Figment
//!
//! Settings are loaded once at process start and passed by reference into the pump
//! layer, the test engine and the project factory. Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. A TOML file (optional)
//! 3. Environment variables prefixed with `SCALE_DAQ_` (`__` separates sections)
//!
//! ```text
//! SCALE_DAQ_APPLICATION__LOG_LEVEL=debug
//! SCALE_DAQ_SERIAL__SETTLE_DELAY_MS=20
//! SCALE_DAQ_DEFAULTS__LIMIT_PSI=1500
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "Scale rig"
//! log_level = "info"
//!
//! [serial]
//! baud_rate = 9600
//! read_timeout_ms = 100
//! settle_delay_ms = 15
//! max_attempts = 3
//!
//! [defaults]
//! baseline = 75
//! limit_psi = 1500
//! limit_minutes = 90.0
//! interval_seconds = 3.0
//! flowrate = 5.0
//! uptake_seconds = 60.0
//! output_format = "JSON"
//!
//! [devices]
//! pump1 = "/dev/ttyUSB0"
//! pump2 = "/dev/ttyUSB1"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::project::OutputFormat;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or extract the settings
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A value failed [`Settings::validate`]
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::LoadError(Box::new(err))
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial link timing for the pumps
    #[serde(default)]
    pub serial: SerialConfig,
    /// Parameters given to newly created projects
    #[serde(default)]
    pub defaults: ProjectDefaults,
    /// Last used pump ports
    #[serde(default)]
    pub devices: DeviceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

/// Serial link configuration shared by both pumps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Baud rate of the pump ports
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// How long one attempt waits for the `/` terminator
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Pause between writing a command and reading its reply
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,
    /// Attempts per command, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl SerialConfig {
    /// Read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Settle delay as a `Duration`
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout(),
            settle_delay_ms: default_settle_delay(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Experiment parameters a new project starts with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefaults {
    /// Clean-flow pressure (psi)
    #[serde(default = "default_baseline")]
    pub baseline: i64,
    /// Pressure limit (psi)
    #[serde(default = "default_limit_psi")]
    pub limit_psi: i64,
    /// Test length (minutes)
    #[serde(default = "default_limit_minutes")]
    pub limit_minutes: f64,
    /// Seconds between readings
    #[serde(default = "default_interval")]
    pub interval_seconds: f64,
    /// mL/min
    #[serde(default = "default_flowrate")]
    pub flowrate: f64,
    /// Uptake duration (seconds)
    #[serde(default = "default_uptake")]
    pub uptake_seconds: f64,
    /// Report output format
    #[serde(default)]
    pub output_format: OutputFormat,
}

impl Default for ProjectDefaults {
    fn default() -> Self {
        Self {
            baseline: default_baseline(),
            limit_psi: default_limit_psi(),
            limit_minutes: default_limit_minutes(),
            interval_seconds: default_interval(),
            flowrate: default_flowrate(),
            uptake_seconds: default_uptake(),
            output_format: OutputFormat::default(),
        }
    }
}

/// Pump port selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial port of pump 1
    #[serde(default)]
    pub pump1: Option<String>,
    /// Serial port of pump 2
    #[serde(default)]
    pub pump2: Option<String>,
}

fn default_name() -> String {
    "scale_daq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_read_timeout() -> u64 {
    100
}

fn default_settle_delay() -> u64 {
    15
}

fn default_max_attempts() -> u32 {
    3
}

fn default_baseline() -> i64 {
    75
}

fn default_limit_psi() -> i64 {
    1500
}

fn default_limit_minutes() -> f64 {
    90.0
}

fn default_interval() -> f64 {
    3.0
}

fn default_flowrate() -> f64 {
    5.0
}

fn default_uptake() -> f64 {
    60.0
}

impl Settings {
    /// Load from an optional TOML file plus `SCALE_DAQ_` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        Self::extract(figment.merge(Env::prefixed("SCALE_DAQ_").split("__")))
    }

    /// Load from a TOML string without consulting the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Self::extract(Figment::from(Serialized::defaults(Settings::default())).merge(Toml::string(toml)))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Settings = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "serial.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.defaults.interval_seconds <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "defaults.interval_seconds must be positive, got {}",
                self.defaults.interval_seconds
            )));
        }
        if self.defaults.limit_minutes <= 0.0 || self.defaults.limit_psi <= 0 {
            return Err(ConfigError::ValidationError(
                "defaults.limit_minutes and defaults.limit_psi must be positive".to_string(),
            ));
        }
        if self.defaults.uptake_seconds < 0.0 {
            return Err(ConfigError::ValidationError(
                "defaults.uptake_seconds cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.serial.max_attempts, 3);
        assert_eq!(settings.serial.settle_delay(), Duration::from_millis(15));
        assert_eq!(settings.defaults.limit_psi, 1500);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml_str(
            r#"
[defaults]
limit_psi = 2000
interval_seconds = 5.0

[devices]
pump1 = "COM3"
"#,
        )
        .unwrap();
        assert_eq!(settings.defaults.limit_psi, 2000);
        assert_eq!(settings.defaults.interval_seconds, 5.0);
        assert_eq!(settings.defaults.baseline, 75);
        assert_eq!(settings.devices.pump1.as_deref(), Some("COM3"));
        assert!(settings.devices.pump2.is_none());
        assert_eq!(settings.serial.baud_rate, 9600);
    }

    #[test]
    fn test_rejects_non_positive_interval() {
        let result = Settings::from_toml_str("[defaults]\ninterval_seconds = 0.0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let result = Settings::from_toml_str("[serial]\nmax_attempts = 0\n");
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[application]\nlog_level = \"debug\"\n").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.application.log_level, "debug");
    }
}
