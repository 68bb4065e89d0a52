// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for burstmap-core.
//!
//! Two layers are kept apart:
//!
//! - [`CallError`] describes why a single call did not produce a value. It is
//!   cloneable and serializable so memoized futures can hand the same failure
//!   out to every reader, and so callers can treat failures as data.
//! - [`Error`] is the crate-level error returned by engine operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::job::CallKey;
use crate::pubsub::PubSubError;
use crate::storage::StorageError;

/// Result type using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Why a call ended without a plain value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum CallError {
    /// The remote function raised an error.
    #[error("call raised {error_type}: {message}")]
    Execution {
        /// Error type name reported by the worker.
        error_type: String,
        /// Error message reported by the worker.
        message: String,
        /// Stack snapshot captured by the worker, if any.
        traceback: Option<String>,
    },

    /// The call ran longer than its execution budget.
    #[error("call exceeded its execution timeout of {timeout_secs}s")]
    ExecutionTimeout {
        /// Execution timeout of the job, in seconds.
        timeout_secs: u64,
    },

    /// The call finished but its output never appeared in storage.
    #[error("result unavailable after {attempts} retrieval attempts")]
    ResultUnavailable {
        /// Number of output lookups performed.
        attempts: u32,
    },

    /// The call was never admitted because its job failed during dispatch.
    #[error("dispatch failed: {reason}")]
    DispatchFailed {
        /// Reason the job was aborted.
        reason: String,
    },

    /// A status or output document could not be decoded.
    #[error("malformed {document} document: {reason}")]
    Malformed {
        /// Which document was malformed (status, output, event).
        document: String,
        /// Decoder error.
        reason: String,
    },

    /// The retry coordinator gave up on this input.
    #[error("retry bound exceeded after {attempts} attempts: {last}")]
    RetryBoundExceeded {
        /// Total number of invocations made for the input.
        attempts: u32,
        /// The failure of the final attempt.
        last: Box<CallError>,
    },
}

impl CallError {
    /// Machine-readable code for this failure kind.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Execution { .. } => "EXECUTION_EXCEPTION",
            Self::ExecutionTimeout { .. } => "EXECUTION_TIMEOUT",
            Self::ResultUnavailable { .. } => "RESULT_UNAVAILABLE",
            Self::DispatchFailed { .. } => "DISPATCH_FAILED",
            Self::Malformed { .. } => "MALFORMED_DOCUMENT",
            Self::RetryBoundExceeded { .. } => "RETRY_BOUND_EXCEEDED",
        }
    }

    /// True when the call actually ran and failed (including timeouts).
    pub fn is_execution_failure(&self) -> bool {
        matches!(self, Self::Execution { .. } | Self::ExecutionTimeout { .. })
    }

    /// Build an execution failure from a worker-reported error.
    pub fn execution(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            error_type: error_type.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub(crate) fn malformed(document: &str, err: impl std::fmt::Display) -> Self {
        Self::Malformed {
            document: document.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The compute backend failed.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The storage collaborator failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The push-notification collaborator failed.
    #[error("Pub/sub error: {0}")]
    PubSub(#[from] PubSubError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local engine and backend runtime speak different protocol versions.
    #[error("Protocol mismatch: local engine {local}, runtime {runtime}")]
    ProtocolMismatch {
        /// Engine version of this process.
        local: String,
        /// Engine version reported by the backend runtime.
        runtime: String,
    },

    /// A call failed and the caller asked for failures to be raised.
    #[error("Call {call} failed: {source}")]
    Call {
        /// The failed call.
        call: CallKey,
        /// Why it failed.
        #[source]
        source: CallError,
    },

    /// The operation is not supported in the current state.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// A wait hit its deadline and the caller asked for that to be an error.
    #[error("Wait timed out with {not_done} of {total} calls not done")]
    WaitTimeout {
        /// Calls that were still pending.
        not_done: usize,
        /// Calls that were being waited on.
        total: usize,
    },

    /// A wait was interrupted by the caller.
    #[error("Wait interrupted with {not_done} calls not done")]
    Interrupted {
        /// Calls that were still pending.
        not_done: usize,
    },

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The executor was shut down.
    #[error("Executor is shut down")]
    ShutDown,
}

impl Error {
    /// Wrap a call failure with the identity of the call.
    pub fn call(call: &CallKey, source: CallError) -> Self {
        Self::Call {
            call: call.clone(),
            source,
        }
    }

    /// The underlying call failure, if this error carries one.
    pub fn call_error(&self) -> Option<&CallError> {
        match self {
            Self::Call { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_codes() {
        let cases = vec![
            (CallError::execution("ValueError", "boom"), "EXECUTION_EXCEPTION"),
            (
                CallError::ExecutionTimeout { timeout_secs: 10 },
                "EXECUTION_TIMEOUT",
            ),
            (
                CallError::ResultUnavailable { attempts: 3 },
                "RESULT_UNAVAILABLE",
            ),
            (
                CallError::DispatchFailed {
                    reason: "x".into(),
                },
                "DISPATCH_FAILED",
            ),
            (CallError::malformed("status", "eof"), "MALFORMED_DOCUMENT"),
            (
                CallError::RetryBoundExceeded {
                    attempts: 2,
                    last: Box::new(CallError::execution("E", "m")),
                },
                "RETRY_BOUND_EXCEEDED",
            ),
        ];

        for (err, code) in cases {
            assert_eq!(err.error_code(), code, "wrong code for {:?}", err);
        }
    }

    #[test]
    fn test_execution_failure_classification() {
        assert!(CallError::execution("E", "m").is_execution_failure());
        assert!(CallError::ExecutionTimeout { timeout_secs: 1 }.is_execution_failure());
        assert!(!CallError::ResultUnavailable { attempts: 1 }.is_execution_failure());
    }

    #[test]
    fn test_call_error_serializes_with_kind_tag() {
        let err = CallError::RetryBoundExceeded {
            attempts: 3,
            last: Box::new(CallError::ExecutionTimeout { timeout_secs: 5 }),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "retry_bound_exceeded");
        assert_eq!(json["last"]["kind"], "execution_timeout");

        let back: CallError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_error_display_includes_call() {
        let key = CallKey::new("ex", "M000", "00003");
        let err = Error::call(&key, CallError::execution("KeyError", "missing"));
        let msg = err.to_string();
        assert!(msg.contains("ex/M000/00003"));
        assert!(msg.contains("KeyError"));
        assert!(err.call_error().is_some());
    }
}
