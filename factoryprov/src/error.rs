//! Error types for factoryprov.

use {
    crate::flash::{ConnectAttempt, FlashStage},
    serde::Serialize,
    std::{fmt, io, path::PathBuf},
    thiserror::Error,
};

/// Result type for factoryprov operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for factoryprov operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Port could not be opened, or the channel is closed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response or process exit within the deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The unlock handshake after opening the port was not acknowledged.
    #[error("Device unlock failed: {0}")]
    DeviceUnlockFailed(String),

    /// The device answered with an explicit failure token.
    #[error("Command `{command}` failed: {response}")]
    Command {
        /// Command text as sent.
        command: String,
        /// The line that rejected it.
        response: String,
    },

    /// A response arrived but its payload could not be interpreted.
    #[error("Parse error: {0}")]
    Parse(String),

    /// JSON payload could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A single tool binary could not be spawned.
    #[error("Tool not found: {}", .0.display())]
    ToolNotFound(PathBuf),

    /// Neither flash backend is installed.
    #[error("No debug-probe tool found (looked for {primary} and {secondary})")]
    ProbeNotFound {
        /// Primary tool path that was checked.
        primary: String,
        /// Secondary tool path that was checked.
        secondary: String,
    },

    /// Every connect strategy of both backends failed.
    #[error("Could not connect to target after {0} attempts")]
    StrategiesExhausted(usize),

    /// The tool reported a programming failure.
    #[error("Flash failed: {0}")]
    FlashFailed(String),

    /// Read-back did not match the written image.
    #[error("Flash verification failed")]
    FlashVerifyFailed,

    /// Another flash job is already active.
    #[error("A flash job is already in progress")]
    Busy,

    /// Firmware image does not fit the target flash.
    #[error("Firmware is {size} bytes but the target only has {capacity} bytes of flash")]
    FirmwareTooLarge {
        /// Image size in bytes.
        size: u64,
        /// Flash capacity in bytes.
        capacity: u64,
    },

    /// Firmware file does not exist.
    #[error("Firmware not found: {}", .0.display())]
    FirmwareNotFound(PathBuf),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid caller-supplied configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A flash job that had started ended in `Failed`.
    #[error("{0}")]
    JobFailed(Box<FailedJob>),
}

impl Error {
    /// The underlying cause, looking through [`Error::JobFailed`].
    pub fn root(&self) -> &Error {
        match self {
            Self::JobFailed(job) => job
                .cause
                .root(),
            other => other,
        }
    }

    /// Whether this error (or its root cause) is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Self::Timeout(_))
    }
}

/// Details of a flash job that reached the `Failed` stage.
#[derive(Debug)]
pub struct FailedJob {
    /// Last stage entered before the failure.
    pub stage: FlashStage,
    /// What went wrong.
    pub cause: Error,
    /// Every connection attempt made by the job, in order.
    pub attempts: Vec<ConnectAttempt>,
    /// Last captured tool output, verbatim.
    pub output: String,
}

impl fmt::Display for FailedJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flash job failed while {}: {}", self.stage, self.cause)
    }
}

/// Structured result handed across the engine boundary.
///
/// Callers render partial results from this instead of matching on errors.
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable failure description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operation payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Outcome<T> {
    /// Successful outcome carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    /// Failed outcome carrying a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(err) => Self::failed(err.to_string()),
        }
    }
}
