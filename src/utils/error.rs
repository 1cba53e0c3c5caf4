//! Error types and handling
//!
//! The fault taxonomy shared by the sources, the control loops, the episode
//! writer and the session controller.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Hard failure of a device or its transport (bus I/O error, disconnect).
///
/// Distinct from [`crate::capture::Sample::Unavailable`], which only means
/// "no new data yet".
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{source_name}: {message}")]
pub struct SourceFault {
    /// Which source failed (e.g. "leader", "camera_1")
    pub source_name: String,
    pub message: String,
}

impl SourceFault {
    pub fn new(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

/// Faults raised by the teleoperation loop.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TeleopFault {
    #[error("leader input stale for {ticks} consecutive ticks")]
    StaleInput { ticks: u32 },

    #[error("source fault: {0}")]
    Source(#[from] SourceFault),
}

/// Failure to persist an episode.
///
/// When a temporary artifact was already created it is retained on disk and
/// its path is carried here for manual recovery.
#[derive(Error, Debug)]
#[error("failed to write episode {episode_num}: {reason}")]
pub struct WriteFault {
    pub episode_num: u64,
    pub reason: String,
    pub temp_path: Option<PathBuf>,
}

/// Errors decoding an episode container.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Header error: {0}")]
    Header(#[from] serde_json::Error),

    #[error("Not an episode file (bad magic)")]
    BadMagic,

    #[error("Unsupported container version {0}")]
    UnsupportedVersion(u32),

    #[error("Missing dataset: {0}")]
    MissingDataset(String),

    #[error("Dataset {name} is malformed: {reason}")]
    Malformed { name: String, reason: String },
}

/// Invalid or inconsistent configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// A command arrived in a state that forbids it.
///
/// Never fatal: the controller logs it, broadcasts a warning and leaves its
/// state untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{command} is not valid while {state}")]
pub struct InvalidTransition {
    pub command: String,
    pub state: String,
}

/// Errors from session controller operations
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceFault),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Session controller is no longer running")]
    ControllerGone,
}

/// Error summary published on the status channel for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<&SessionError> for ErrorResponse {
    fn from(error: &SessionError) -> Self {
        let code = match error {
            SessionError::Io(_) => "IO_ERROR",
            SessionError::Config(_) => "CONFIG_ERROR",
            SessionError::Source(_) => "SOURCE_FAULT",
            SessionError::Worker(_) => "WORKER_ERROR",
            SessionError::ControllerGone => "CONTROLLER_GONE",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<&TeleopFault> for ErrorResponse {
    fn from(fault: &TeleopFault) -> Self {
        let code = match fault {
            TeleopFault::StaleInput { .. } => "STALE_INPUT",
            TeleopFault::Source(_) => "SOURCE_FAULT",
        };

        ErrorResponse {
            code: code.to_string(),
            message: fault.to_string(),
        }
    }
}

impl From<&WriteFault> for ErrorResponse {
    fn from(fault: &WriteFault) -> Self {
        ErrorResponse {
            code: "WRITE_FAULT".to_string(),
            message: fault.to_string(),
        }
    }
}

/// Result type alias using SessionError
pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let fault = TeleopFault::StaleInput { ticks: 6 };
        let response = ErrorResponse::from(&fault);
        assert_eq!(response.code, "STALE_INPUT");
        assert!(response.message.contains('6'));

        let err = SessionError::Source(SourceFault::new("follower", "bus timeout"));
        let response = ErrorResponse::from(&err);
        assert_eq!(response.code, "SOURCE_FAULT");
        assert!(response.message.contains("follower"));
    }
}
