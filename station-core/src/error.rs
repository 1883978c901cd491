//! Error types for the provisioning core.
//!
//! Each failure carries a readable message, and the ones caused by the
//! flashing tool also carry its captured output for the audit log.

use crate::models::{FlashStage, HardwareHint};
use std::path::PathBuf;
use thiserror::Error;

/// The external tool could not be run at all.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to launch `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum CommError {
    /// Every baud option was probed without an answer.
    #[error("no response from device on {port}")]
    Unreachable { port: String, output: String },

    #[error(transparent)]
    Tool(#[from] ToolError),
}

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("a flash job is already running")]
    Busy,

    #[error("firmware image {} not found", .0.display())]
    FirmwareMissing(PathBuf),

    #[error("{stage} stage failed ({}), retry required", describe_exit(.exit_code, .timed_out))]
    Stage {
        stage: FlashStage,
        exit_code: Option<i32>,
        timed_out: bool,
        output: String,
    },

    #[error("{stage} stage could not start: {source}")]
    Tool {
        stage: FlashStage,
        #[source]
        source: ToolError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config file {} is not valid: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unknown config key `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for `{key}`: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to encode config: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Top-level failure reported by the station.
#[derive(Debug, Error)]
pub enum StationError {
    #[error("no ESP32 serial port found")]
    NoHardware { hint: Option<HardwareHint> },

    #[error("port {0} is not attached")]
    UnknownPort(String),

    #[error("station is busy; wait for the current job to finish")]
    Busy,

    #[error("station worker has stopped")]
    Stopped,

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error(transparent)]
    Flash(#[from] FlashError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CommError {
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            CommError::Unreachable { output, .. } => Some(output),
            CommError::Tool(_) => None,
        }
    }
}

impl FlashError {
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            FlashError::Stage { output, .. } => Some(output),
            _ => None,
        }
    }
}

impl StationError {
    /// Raw tool output behind this failure, if any.
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            StationError::NoHardware { hint } => hint.as_ref().map(|h| h.to_string()),
            StationError::Comm(e) => e.diagnostics().map(str::to_string),
            StationError::Flash(e) => e.diagnostics().map(str::to_string),
            _ => None,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>, timed_out: &bool) -> String {
    match (*exit_code, *timed_out) {
        (_, true) => "timed out".to_string(),
        (Some(code), false) => format!("exit code {}", code),
        (None, false) => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, StationError>;
