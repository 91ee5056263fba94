//! The controller's error taxonomy (§7). Every fallible operation in
//! `pnio-types` and `pnio-controller` returns a `PnioError`; the AR state
//! machine consults [`PnioError::is_permanent`] / [`PnioError::is_retryable`]
//! when deciding whether to retry a failed connect attempt.

use thiserror::Error;

/// Errors produced by the AR lifecycle and cyclic exchange engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PnioError {
    /// Bad input at an API boundary: null/empty station name, out-of-range
    /// slot, malformed config.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// An allocation failed (IOCR buffers, AR table entry).
    #[error("allocation failed: {0}")]
    NoMemory(String),
    /// The AR table is at capacity.
    #[error("AR table is full")]
    Full,
    /// `create_ar` called with a station name already present.
    #[error("AR for station '{0}' already exists")]
    AlreadyExists(String),
    /// Lookup miss (`get_ar`, `get_ar_by_frame_id`, cache probe).
    #[error("not found: {0}")]
    NotFound(String),
    /// The RPC transport or the controller IP has not been initialized yet.
    #[error("not initialized: {0}")]
    NotInitialized(String),
    /// A connect, ParameterEnd, ApplicationReady, or watchdog deadline
    /// elapsed. Retryable.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// The RPC `connect` primitive returned `success: false`. Retryable.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Raw socket send failure. Retryable.
    #[error("io error: {0}")]
    Io(String),
    /// Malformed RPC PDU or unexpected opcode. Permanent.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Device refused the AR. Permanent.
    #[error("permission denied: {0}")]
    Permission(String),
}

impl PnioError {
    /// `true` for errors the state machine must not retry (§4.5 /
    /// §7): PROTOCOL and PERMISSION.
    pub fn is_permanent(&self) -> bool {
        matches!(self, PnioError::Protocol(_) | PnioError::Permission(_))
    }

    /// `true` for errors eligible for exponential-backoff retry (§4.5 /
    /// §7): TIMEOUT, CONNECTION_FAILED, IO.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PnioError::Timeout(_) | PnioError::ConnectionFailed(_) | PnioError::Io(_)
        )
    }

    /// The `log` level a state transition caused by this error should be
    /// reported at (§7: INFO normal, WARN retryable, ERROR permanent).
    pub fn log_level(&self) -> log::Level {
        if self.is_permanent() {
            log::Level::Error
        } else if self.is_retryable() {
            log::Level::Warn
        } else {
            log::Level::Info
        }
    }
}

impl From<std::io::Error> for PnioError {
    fn from(value: std::io::Error) -> Self {
        PnioError::Io(value.to_string())
    }
}
