//! Error types for normshap.
//!
//! All errors in normshap are strongly typed using thiserror.
//! Configuration and parameter errors are raised before any simulation
//! work starts; executor errors abort the enclosing computation as a whole.

use serde::Serialize;
use thiserror::Error;

/// Upper bound on the length of an error message returned to external callers.
pub const MAX_ERROR_MESSAGE_LEN: usize = 256;

/// Baseline and current normative systems disagree on their shape.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MismatchError {
    /// The two systems contain different norm ids.
    #[error("Norm sets differ: missing from current {missing_in_current:?}, missing from baseline {missing_in_baseline:?}")]
    NormSet {
        /// Present in the baseline only.
        missing_in_current: Vec<String>,
        /// Present in the current system only.
        missing_in_baseline: Vec<String>,
    },

    /// One norm has different parameter keys in the two systems.
    #[error("Norm '{norm}' has different parameters: missing from current {missing_in_current:?}, missing from baseline {missing_in_baseline:?}")]
    ParamKeys {
        /// Offending norm.
        norm: String,
        /// Keys present in the baseline only.
        missing_in_current: Vec<String>,
        /// Keys present in the current system only.
        missing_in_baseline: Vec<String>,
    },
}

/// Invalid numeric or structural parameters passed to the estimator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    /// A count that must be at least one was zero.
    #[error("Parameter '{name}' must be positive")]
    NotPositive {
        /// Parameter name.
        name: String,
    },

    /// The target norm is not in the system.
    #[error("Norm '{norm}' is not part of the normative system")]
    UnknownNorm {
        /// Norm id.
        norm: String,
    },

    /// A norm id was given twice.
    #[error("Norm '{norm}' appears more than once")]
    DuplicateNorm {
        /// Norm id.
        norm: String,
    },

    /// A count exceeds its configured limit.
    #[error("Parameter '{name}' is {value}, above the limit of {max}")]
    TooLarge {
        /// Parameter name.
        name: String,
        /// Requested value.
        value: usize,
        /// Configured limit.
        max: usize,
    },

    /// The normative systems have no norms.
    #[error("Normative system is empty")]
    EmptySystem,

    /// Coalition enumeration would be too large.
    #[error("Too many norms: {count} norms would need 2^{exponent} coalitions (max norms: {max})")]
    TooManyNorms {
        /// Number of norms.
        count: usize,
        /// `count - 1`.
        exponent: usize,
        /// Configured `max_norms`.
        max: usize,
    },

    /// Estimator settings failed validation.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong.
        reason: String,
    },
}

/// Failures of the task-parallel executor or of a simulation trial.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    /// A worker thread could not be spawned.
    #[error("Failed to start worker pool: {message}")]
    SpawnFailed {
        /// Diagnostic text.
        message: String,
    },

    /// Workers went away before every trial reported back.
    #[error("Worker pool disconnected")]
    Disconnected,

    /// A trial panicked; `message` is the panic payload.
    #[error("Trial {trial} panicked: {message}")]
    TrialPanicked {
        /// Trial index.
        trial: usize,
        /// Diagnostic text.
        message: String,
    },

    /// A model step returned an error.
    #[error("Trial {trial} failed at step {step}: {message}")]
    StepFailed {
        /// Trial index.
        trial: usize,
        /// Zero-based step index.
        step: usize,
        /// Error text from the model.
        message: String,
    },

    /// The value function returned NaN or an infinity.
    #[error("Trial {trial} produced a non-finite score")]
    NonFiniteScore {
        /// Trial index.
        trial: usize,
    },

    /// The cancel token fired.
    #[error("Computation was cancelled")]
    Cancelled,
}

/// Boundary-level errors for malformed external requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is absent.
    #[error("Required field '{field}' is missing")]
    MissingField {
        /// Field name.
        field: String,
    },

    /// A field has the wrong JSON type.
    #[error("Field '{field}' must be of type {expected}")]
    WrongType {
        /// Field name.
        field: String,
        /// Human-readable expected type.
        expected: String,
    },

    /// Content type other than `application/json`.
    #[error("Request must be JSON")]
    UnsupportedContentType,

    /// Body is not valid UTF-8 or JSON, or has the wrong shape.
    #[error("Malformed request body: {reason}")]
    MalformedBody {
        /// What was wrong.
        reason: String,
    },

    /// Body larger than the transport limit.
    #[error("Request body exceeds maximum size of {max_bytes} bytes")]
    BodyTooLarge {
        /// Configured limit in bytes.
        max_bytes: usize,
    },

    /// Blank norm id.
    #[error("Norm identifier cannot be empty")]
    EmptyNormId,
}

/// Serializable classification of a [`NormshapError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Baseline/current key sets disagree.
    ConfigMismatch,
    /// Non-positive sampling parameters and similar.
    InvalidParameter,
    /// A worker task failed or the executor could not be provisioned.
    ExecutorError,
    /// Boundary-layer issue with the request itself.
    ValidationError,
    /// Unexpected internal state.
    Internal,
}

/// Top-level error type for normshap.
#[derive(Debug, Error)]
pub enum NormshapError {
    /// Baseline and current systems are incompatible.
    #[error("Configuration mismatch: {0}")]
    ConfigMismatch(#[from] MismatchError),

    /// Rejected parameter or estimator setting.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(#[from] ParameterError),

    /// A trial or the worker pool failed.
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Malformed external request.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unexpected internal state, such as a poisoned lock.
    #[error("Internal error: {message}")]
    Internal {
        /// Diagnostic text.
        message: String,
    },
}

impl NormshapError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the error classification.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigMismatch(_) => ErrorKind::ConfigMismatch,
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::Executor(_) => ErrorKind::ExecutorError,
            Self::Validation(_) => ErrorKind::ValidationError,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if this error was detected before any simulation ran.
    #[must_use]
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::ConfigMismatch(_) | Self::InvalidParameter(_) | Self::Validation(_)
        )
    }

    /// Message safe to return to external callers.
    ///
    /// Internal errors, panic payloads and model step errors are replaced by
    /// generic text, and
    /// every message is truncated to [`MAX_ERROR_MESSAGE_LEN`] bytes.
    #[must_use]
    pub fn public_message(&self) -> String {
        let msg = match self {
            Self::Internal { .. } => "internal error".to_string(),
            Self::Executor(ExecutorError::TrialPanicked { trial, .. }) => {
                format!("simulation trial {trial} failed")
            }
            Self::Executor(ExecutorError::StepFailed { trial, step, .. }) => {
                format!("simulation trial {trial} failed at step {step}")
            }
            Self::Executor(ExecutorError::SpawnFailed { .. }) => {
                "worker pool could not be started".to_string()
            }
            other => other.to_string(),
        };
        truncate_message(msg)
    }
}

fn truncate_message(mut msg: String) -> String {
    if msg.len() <= MAX_ERROR_MESSAGE_LEN {
        return msg;
    }
    let mut cut = MAX_ERROR_MESSAGE_LEN;
    while !msg.is_char_boundary(cut) {
        cut -= 1;
    }
    msg.truncate(cut);
    msg.push_str("...");
    msg
}

/// Result type alias for normshap operations.
pub type NormshapResult<T> = Result<T, NormshapError>;
