//! Unified error handling for the bridgesrv workspace
//!
//! Per-transaction faults never surface here: the bridge engine absorbs them and
//! answers the network peer with a Modbus exception. This crate covers the
//! process-level failures (startup, configuration, I/O, codec, watchdog restart).

use thiserror::Error;

// ============================================================================
// BridgeError - Main error type
// ============================================================================

/// Main error type for the bridge service and its libraries
#[derive(Debug, Error)]
pub enum BridgeError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Transport Errors
    // ======================================
    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Serial port error: {port}: {reason}")]
    SerialPort { port: String, reason: String },

    #[error("Frame error: {0}")]
    Frame(String),

    // ======================================
    // Request Errors
    // ======================================
    #[error("Empty PDU: a request must carry at least a function code")]
    EmptyPdu,

    #[error("PDU too large: {len} bytes exceeds the {max} byte limit")]
    PduTooLarge { len: usize, max: usize },

    // ======================================
    // Runtime Errors
    // ======================================
    #[error("Queue watchdog expired after {elapsed_ms} ms, restart requested")]
    WatchdogRestart { elapsed_ms: u64 },

    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using BridgeError
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Network,
    Serial,
    Protocol,
    Validation,
    Fatal,
    Internal,
}

impl BridgeError {
    /// Stable error code for logs and exit diagnostics
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::Bind { .. } => "BIND_FAILED",
            Self::SerialPort { .. } => "SERIAL_PORT_ERROR",
            Self::Frame(_) => "FRAME_ERROR",
            Self::EmptyPdu => "EMPTY_PDU",
            Self::PduTooLarge { .. } => "PDU_TOO_LARGE",
            Self::WatchdogRestart { .. } => "WATCHDOG_RESTART",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    /// Error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,
            Self::Bind { .. } => ErrorCategory::Network,
            Self::SerialPort { .. } => ErrorCategory::Serial,
            Self::Frame(_) => ErrorCategory::Protocol,
            Self::EmptyPdu | Self::PduTooLarge { .. } => ErrorCategory::Validation,
            Self::WatchdogRestart { .. } | Self::StartupFailed(_) => ErrorCategory::Fatal,
            Self::Io(_) | Self::Other(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the supervisor should restart the process after this error
    pub fn requires_restart(&self) -> bool {
        matches!(self, Self::WatchdogRestart { .. })
    }

    /// Get log level
    pub fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Fatal | ErrorCategory::Internal | ErrorCategory::Configuration => {
                Level::ERROR
            },
            ErrorCategory::Network | ErrorCategory::Serial | ErrorCategory::Protocol => {
                Level::WARN
            },
            ErrorCategory::Validation => Level::INFO,
        }
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::BridgeError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::BridgeError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! frame_error {
    ($msg:expr) => {
        $crate::BridgeError::Frame($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::BridgeError::Frame(format!($fmt, $($arg)*))
    };
}
