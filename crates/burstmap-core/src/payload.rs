// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation payload handed to compute backends.
//!
//! One payload describes one physical invocation, i.e. one chunk of a job.
//! The payload is JSON; binary fields are base64-encoded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::{CallInput, CallKey, Job, JobKey};

/// Serde adapter storing `Vec<u8>` as a base64 string.
pub mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as base64.
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    /// Deserialize bytes from base64.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// One call inside an invocation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadCall {
    /// Positional call id.
    pub call_id: String,
    /// Input of the call.
    pub input: CallInput,
}

/// Everything a worker needs to execute one chunk of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationPayload {
    /// Engine version of the dispatching process.
    pub engine_version: String,
    /// Executor that created the job.
    pub executor_id: String,
    /// Job id.
    pub job_id: String,
    /// Index of the chunk within the job.
    pub chunk_index: usize,
    /// Backend runtime reference.
    pub runtime: String,
    /// Opaque function descriptor.
    #[serde(with = "base64_bytes")]
    pub function: Vec<u8>,
    /// Calls of this chunk, in call-id order.
    pub calls: Vec<PayloadCall>,
    /// Execution timeout per call, in seconds.
    pub execution_timeout_secs: u64,
    /// Topic to publish completion events on, when the push strategy is in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_topic: Option<String>,
}

impl InvocationPayload {
    /// Build the payload for the chunk of `job` covering `calls`.
    pub fn for_chunk(
        job: &Job,
        chunk_index: usize,
        calls: std::ops::Range<usize>,
        notify_topic: Option<String>,
    ) -> Self {
        let key = job.key();
        Self {
            engine_version: job.engine_version().to_string(),
            executor_id: key.executor_id.clone(),
            job_id: key.job_id.clone(),
            chunk_index,
            runtime: job.runtime().to_string(),
            function: job.function().to_vec(),
            calls: job.calls()[calls]
                .iter()
                .map(|c| PayloadCall {
                    call_id: c.call_id.clone(),
                    input: c.input.clone(),
                })
                .collect(),
            execution_timeout_secs: job.execution_timeout().as_secs(),
            notify_topic,
        }
    }

    /// Encode as JSON bytes.
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON bytes.
    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Job identity.
    pub fn job_key(&self) -> JobKey {
        JobKey::new(&self.executor_id, &self.job_id)
    }

    /// Identity of the call at `index` in this payload.
    pub fn call_key(&self, index: usize) -> Option<CallKey> {
        self.calls
            .get(index)
            .map(|c| CallKey::new(&self.executor_id, &self.job_id, &c.call_id))
    }

    /// Execution timeout per call.
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            JobKey::new("ex1", "M000"),
            b"square".to_vec(),
            (0..5).map(|i| CallInput::inline(vec![i])).collect(),
        )
        .with_chunksize(2)
        .with_execution_timeout(Duration::from_secs(30))
    }

    #[test]
    fn test_payload_for_last_chunk_carries_remainder() {
        let job = job();
        let ranges = job.chunk_ranges();
        let payload = InvocationPayload::for_chunk(&job, 2, ranges[2].clone(), None);

        assert_eq!(payload.chunk_index, 2);
        assert_eq!(payload.calls.len(), 1);
        assert_eq!(payload.calls[0].call_id, "00004");
        assert_eq!(payload.execution_timeout(), Duration::from_secs(30));
        assert_eq!(
            payload.call_key(0),
            Some(CallKey::new("ex1", "M000", "00004"))
        );
        assert!(payload.call_key(1).is_none());
    }

    #[test]
    fn test_payload_encoding_uses_base64_function() {
        let job = job();
        let payload =
            InvocationPayload::for_chunk(&job, 0, 0..2, Some(job.key().topic()));

        let bytes = payload.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["function"], "c3F1YXJl");
        assert_eq!(json["notify_topic"], "burstmap-ex1-M000");

        let decoded = InvocationPayload::decode(&bytes).unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(decoded.job_key(), *job.key());
    }

    #[test]
    fn test_decode_rejects_invalid_base64() {
        let bad = br#"{"engine_version":"1","executor_id":"e","job_id":"j","chunk_index":0,
            "runtime":"r","function":"***","calls":[],"execution_timeout_secs":1}"#;
        assert!(InvocationPayload::decode(bad).is_err());
    }
}
