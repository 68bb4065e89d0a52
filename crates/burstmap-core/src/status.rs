// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Documents exchanged between workers and the engine.
//!
//! - [`CallStatus`]: written once per call when it finishes (`.../status`).
//! - [`CallOutput`]: the call's return value or nested call references (`.../output`).
//! - [`CompletionEvent`]: `init`/`end` notifications consumed by the monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::job::CallKey;

/// Status document of a finished call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatus {
    /// Executor that created the call's job.
    pub executor_id: String,
    /// Job id.
    pub job_id: String,
    /// Call id.
    pub call_id: String,
    /// Backend activation that ran the call.
    #[serde(default)]
    pub activation_id: Option<String>,
    /// True when the call raised an error.
    pub exception: bool,
    /// The error raised by the call, when `exception` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
    /// When the worker started the call.
    pub start_time: DateTime<Utc>,
    /// When the worker finished the call.
    pub end_time: DateTime<Utc>,
    /// Input size in bytes.
    #[serde(default)]
    pub input_size: u64,
    /// Output size in bytes.
    #[serde(default)]
    pub output_size: u64,
    /// Calls spawned by this call whose results replace its own value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_futures: Vec<CallKey>,
}

impl CallStatus {
    /// Identity of the call this document describes.
    pub fn call_key(&self) -> CallKey {
        CallKey::new(&self.executor_id, &self.job_id, &self.call_id)
    }

    /// The call's failure, if it raised one.
    pub fn failure(&self) -> Option<CallError> {
        if !self.exception {
            return None;
        }
        Some(self.error.clone().unwrap_or_else(|| {
            CallError::execution(
                "UnknownError",
                "worker reported an exception without details",
            )
        }))
    }

    /// Whether the call produced more calls (dynamic fan-out).
    pub fn has_new_futures(&self) -> bool {
        !self.new_futures.is_empty()
    }

    /// Worker-side execution time in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }

    /// Encode as JSON bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CallError> {
        serde_json::from_slice(bytes).map_err(|e| CallError::malformed("status", e))
    }
}

/// Output document of a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallOutput {
    /// A plain value.
    Value {
        /// The returned value.
        value: serde_json::Value,
    },
    /// References to further calls whose results stand in for this call's value.
    Futures {
        /// The spawned calls.
        futures: Vec<CallKey>,
    },
}

impl CallOutput {
    /// Encode as JSON bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CallError> {
        serde_json::from_slice(bytes).map_err(|e| CallError::malformed("output", e))
    }
}

/// Kind of completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The backend started executing the call.
    Init,
    /// The call finished (successfully or not).
    End,
}

/// A notification that a call started or finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEvent {
    /// Event kind.
    pub kind: EventKind,
    /// The call the event is about.
    pub call: CallKey,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
    /// Backend activation running the call.
    #[serde(default)]
    pub activation_id: Option<String>,
    /// Status document (end events only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
}

impl CompletionEvent {
    /// Build an `init` event.
    pub fn init(call: CallKey, activation_id: Option<String>) -> Self {
        Self {
            kind: EventKind::Init,
            call,
            timestamp: Utc::now(),
            activation_id,
            status: None,
        }
    }

    /// Build an `end` event from a status document.
    pub fn end(status: CallStatus) -> Self {
        Self {
            kind: EventKind::End,
            call: status.call_key(),
            timestamp: status.end_time,
            activation_id: status.activation_id.clone(),
            status: Some(status),
        }
    }

    /// Encode as JSON bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CallError> {
        serde_json::from_slice(bytes).map_err(|e| CallError::malformed("event", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(exception: bool) -> CallStatus {
        let now = Utc::now();
        CallStatus {
            executor_id: "ex".into(),
            job_id: "M000".into(),
            call_id: "00001".into(),
            activation_id: Some("act-1".into()),
            exception,
            error: None,
            start_time: now - chrono::Duration::milliseconds(250),
            end_time: now,
            input_size: 4,
            output_size: 16,
            new_futures: Vec::new(),
        }
    }

    #[test]
    fn test_failure_without_details_is_still_a_failure() {
        let st = status(true);
        let failure = st.failure().unwrap();
        assert_eq!(failure.error_code(), "EXECUTION_EXCEPTION");
        assert!(status(false).failure().is_none());
    }

    #[test]
    fn test_status_decode_malformed() {
        let err = CallStatus::decode(b"{not json").unwrap_err();
        assert!(matches!(err, CallError::Malformed { ref document, .. } if document == "status"));
    }

    #[test]
    fn test_status_duration_and_key() {
        let st = status(false);
        assert_eq!(st.duration_ms(), 250);
        assert_eq!(st.call_key(), CallKey::new("ex", "M000", "00001"));
        assert!(!st.has_new_futures());
    }

    #[test]
    fn test_output_tagging() {
        let value = CallOutput::Value {
            value: serde_json::json!([1, 2, 3]),
        };
        let json: serde_json::Value = serde_json::from_slice(&value.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "value");

        let futures = CallOutput::Futures {
            futures: vec![CallKey::new("ex", "M001", "00000")],
        };
        let decoded = CallOutput::decode(&futures.encode().unwrap()).unwrap();
        assert_eq!(decoded, futures);
    }

    #[test]
    fn test_end_event_carries_status() {
        let event = CompletionEvent::end(status(false));
        assert_eq!(event.kind, EventKind::End);
        assert_eq!(event.activation_id.as_deref(), Some("act-1"));

        let decoded = CompletionEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }
}
