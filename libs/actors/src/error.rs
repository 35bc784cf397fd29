//! Runtime Error Types
//!
//! Errors surfaced by object lifecycle operations, the remote directory and
//! the RPC runtime. Failures raised by user hooks are converted into
//! `UnhandledUserException` at the containment boundaries and never escape
//! a worker thread or a manager fan-out.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Structural problem detected at construction or activation
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Directory key already bound and eviction disabled
    #[error("Registration conflict: {key} is already bound")]
    RegistrationConflict { key: String },

    /// Directory or RPC runtime unreachable
    #[error("Transport unavailable: {message}")]
    TransportUnavailable {
        message: String,
    },

    /// Bounded retry exhausted
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// User hook returned an error or panicked
    #[error("Unhandled exception in {object} during {operation}: {message}")]
    UnhandledUserException {
        object: String,
        operation: String,
        message: String,
    },

    #[error("Not found: {key}")]
    NotFound { key: String },

    /// Operation not allowed in the current lifecycle state
    #[error("Invalid state: {object} is {state}, cannot {operation}")]
    InvalidState {
        object: String,
        state: String,
        operation: String,
    },

    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },

    /// OS-level failure (signals, process control)
    #[error("System error: {message}")]
    System { message: String },
}

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

impl RuntimeError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    pub fn registration_conflict(key: impl ToString) -> Self {
        Self::RegistrationConflict {
            key: key.to_string(),
        }
    }

    /// Create a transport unavailable error
    pub fn transport_unavailable(message: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn user_exception(
        object: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::UnhandledUserException {
            object: object.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound {
            key: key.to_string(),
        }
    }

    pub fn invalid_state(
        object: impl Into<String>,
        state: impl ToString,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            object: object.into(),
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Whether a bounded retry may resolve this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::TransportUnavailable { .. } | RuntimeError::Timeout { .. }
        )
    }

    /// Short category name for structured logs
    pub fn category(&self) -> &'static str {
        match self {
            RuntimeError::Configuration { .. } => "configuration",
            RuntimeError::RegistrationConflict { .. } => "registration_conflict",
            RuntimeError::TransportUnavailable { .. } => "transport_unavailable",
            RuntimeError::Timeout { .. } => "timeout",
            RuntimeError::UnhandledUserException { .. } => "user_exception",
            RuntimeError::NotFound { .. } => "not_found",
            RuntimeError::InvalidState { .. } => "invalid_state",
            RuntimeError::Io { .. } => "io",
            RuntimeError::System { .. } => "system",
        }
    }
}

/// Run a user hook, turning both its error and a panic into
/// `UnhandledUserException`.
pub(crate) fn contain_user<T>(
    object: &str,
    operation: &str,
    hook: impl FnOnce() -> anyhow::Result<T>,
) -> Result<T> {
    match panic::catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(RuntimeError::user_exception(
            object,
            operation,
            format!("{err:#}"),
        )),
        Err(payload) => Err(RuntimeError::user_exception(
            object,
            operation,
            format!("panic: {}", panic_message(payload.as_ref())),
        )),
    }
}

/// Run one step of a fan-out, turning a panic into `UnhandledUserException`
pub(crate) fn contain_step(
    object: &str,
    operation: &str,
    step: impl FnOnce() -> Result<()>,
) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(result) => result,
        Err(payload) => Err(RuntimeError::user_exception(
            object,
            operation,
            format!("panic: {}", panic_message(payload.as_ref())),
        )),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
