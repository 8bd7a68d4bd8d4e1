use std::time::Duration;

/// Service-reported error record.
///
/// Carried on ERROR frames, NACKs and failed state changes. Callers
/// branch on `code`; `status_code` mirrors the nearest HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub code: u32,
    #[serde(rename = "statusCode", default)]
    pub status_code: u16,
    pub message: String,
}

/// First code of the token-expiry family.
pub const TOKEN_ERROR_CODE_START: u32 = 40140;
/// Last code of the token-expiry family (inclusive).
pub const TOKEN_ERROR_CODE_END: u32 = 40149;

impl ErrorInfo {
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
        }
    }

    /// Token-expiry family: recoverable by renewing the credential.
    pub fn is_token_error(&self) -> bool {
        (TOKEN_ERROR_CODE_START..=TOKEN_ERROR_CODE_END).contains(&self.code)
    }

    /// Caller misuse of an API while in the wrong lifecycle state.
    pub fn invalid_state_transition(current: &str, operation: &str) -> Self {
        Self::new(
            90001,
            400,
            format!("invalid state transition: cannot {} while {}", operation, current),
        )
    }

    /// Publish refused because the channel cannot queue right now.
    pub fn queueing_disabled(channel: &str, state: &str) -> Self {
        Self::new(
            91001,
            400,
            format!("unable to publish on channel '{}' ({}): message queueing disabled", channel, state),
        )
    }

    /// Resume failed; ordering of in-flight messages can no longer be honored.
    pub fn unable_to_recover() -> Self {
        Self::new(80008, 400, "unable to recover connection")
    }

    pub fn connection_suspended() -> Self {
        Self::new(80002, 503, "connection suspended")
    }

    pub fn connection_disconnected() -> Self {
        Self::new(80003, 503, "connection temporarily unavailable")
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(80000, 503, message)
    }

    pub fn connection_closed() -> Self {
        Self::new(80017, 400, "connection closed")
    }

    pub fn batch_too_large(count: usize, limit: usize) -> Self {
        Self::new(
            40013,
            400,
            format!("cannot publish {} messages in one call (limit {})", count, limit),
        )
    }

    pub fn channel_detached(channel: &str) -> Self {
        Self::new(90007, 400, format!("channel '{}' detached", channel))
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(50003, 504, format!("{} timed out", operation))
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code: {}, status: {})", self.message, self.code, self.status_code)
    }
}

/// Unified client error type.
#[derive(Debug, thiserror::Error, Clone)]
pub enum RtError {
    /// Connection-level failure; `retryable` drives the retry cycle.
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection { reason: String, retryable: bool },

    /// Frame-level violation: malformed frame, codec failure, serial gap.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// Configuration rejected before any connection attempt.
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration { field: String, reason: String },

    /// Operation did not complete within its window.
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout { operation: String, duration: Duration },

    /// Error reported by the service or synthesized with a service code.
    #[error("Service error: {0}")]
    Service(ErrorInfo),
}

impl RtError {
    pub fn is_retryable(&self) -> bool {
        match self {
            RtError::Connection { retryable, .. } => *retryable,
            RtError::Protocol { .. } => false,
            RtError::Configuration { .. } => false,
            RtError::Timeout { .. } => true,
            RtError::Service(info) => info.is_token_error() || info.status_code >= 500,
        }
    }

    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn protocol_error(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// The `ErrorInfo` handed to pending-message callbacks and state
    /// change records for this error.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            RtError::Service(info) => info.clone(),
            RtError::Connection { reason, .. } => ErrorInfo::connection_failed(reason.clone()),
            RtError::Protocol { reason } => ErrorInfo::new(80013, 400, reason.clone()),
            RtError::Configuration { field, reason } => {
                ErrorInfo::new(40000, 400, format!("invalid option '{}': {}", field, reason))
            }
            RtError::Timeout { operation, .. } => ErrorInfo::timeout(operation),
        }
    }
}

impl From<ErrorInfo> for RtError {
    fn from(info: ErrorInfo) -> Self {
        RtError::Service(info)
    }
}

impl From<serde_json::Error> for RtError {
    fn from(error: serde_json::Error) -> Self {
        RtError::Protocol {
            reason: format!("frame codec: {}", error),
        }
    }
}

impl From<std::io::Error> for RtError {
    fn from(error: std::io::Error) -> Self {
        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );

        RtError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}
