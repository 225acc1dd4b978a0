//! Custom error types for the application.
//!
//! `DaqError` is the single error type of the library. It is built with `thiserror`
//! and groups failures by how the test engine has to react to them:
//!
//! - **`DeviceUnavailable`**: a pump's serial port could not be opened. Surfaced to the
//!   operator; the run is aborted before any hardware starts.
//! - **`PumpProtocolTimeout`**: no `OK` reply after every retry. Pressure polling turns
//!   this into the `-1` sentinel, while run/stop escalate it to an abort.
//! - **`PumpCommand`**: the pump explicitly answered `Er/`. Never retried, always fatal
//!   to the run.
//! - **`Validation`**: the batch of pre-flight issues found by `TestRun::start`. The
//!   whole list is reported at once, never partially.
//! - **`Config`**, **`Io`**, **`Json`**: configuration and persistence failures.
//!
//! Degenerate scoring (no blanks, no protectable area) is not an error; see
//! [`crate::scoring::Degeneracy`].

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every error the library reports.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// File or port I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A project document could not be read or written
    #[error("Project document error: {0}")]
    Json(#[from] serde_json::Error),

    /// The port could not be opened
    #[error("Device on '{port}' is unavailable: {reason}")]
    DeviceUnavailable {
        /// Port name
        port: String,
        /// Why opening failed
        reason: String,
    },

    /// Three attempts without an acknowledged reply
    #[error("No valid response to '{command}' on '{port}' after {attempts} attempts")]
    PumpProtocolTimeout {
        /// Command code sent
        command: String,
        /// Port name
        port: String,
        /// Attempts made
        attempts: u32,
    },

    /// The pump answered `Er/`
    #[error("Pump on '{port}' rejected '{command}' with '{response}'")]
    PumpCommand {
        /// Command code sent
        command: String,
        /// Reply as received
        response: String,
        /// Port name
        port: String,
    },

    /// The link is closed
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// Built without `instrument_serial`
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// Every reason a test could not start
    #[error("Test could not start: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The request needs the rig to be idle
    #[error("A test is in progress")]
    RunInProgress,

    /// The project has no file path yet
    #[error("Project has not been saved yet")]
    ProjectNotSaved,

    /// A worker task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(String),
}

impl DaqError {
    /// True for faults raised by the pump itself or its link, as opposed to
    /// validation or persistence problems.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            DaqError::DeviceUnavailable { .. }
                | DaqError::PumpProtocolTimeout { .. }
                | DaqError::PumpCommand { .. }
                | DaqError::SerialPortNotConnected
        )
    }
}

impl From<tokio::task::JoinError> for DaqError {
    fn from(err: tokio::task::JoinError) -> Self {
        DaqError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::PumpCommand {
            command: "ru".into(),
            response: "Er/".into(),
            port: "COM4".into(),
        };
        assert_eq!(err.to_string(), "Pump on 'COM4' rejected 'ru' with 'Er/'");
        assert!(err.is_device_fault());
    }

    #[test]
    fn test_validation_lists_every_issue() {
        let err = DaqError::Validation(vec![
            "Select a port for pump 1".into(),
            "Name the test".into(),
        ]);
        let text = err.to_string();
        assert!(text.contains("pump 1"));
        assert!(text.contains("Name the test"));
        assert!(!err.is_device_fault());
    }
}
