// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Jobs, calls and their identities.
//!
//! A [`Job`] is built once (by the caller or the executor facade) and is not
//! mutated after dispatch begins. Call ids are assigned positionally as
//! zero-padded ordinals, so the same inputs always produce the same ids.

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ENGINE_VERSION;

/// Width of zero-padded call ids (`00000`, `00001`, ...).
pub const CALL_ID_WIDTH: usize = 5;

/// Default execution timeout of a job.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

/// Format the positional call id for the call at `index`.
pub fn format_call_id(index: usize) -> String {
    format!("{:0width$}", index, width = CALL_ID_WIDTH)
}

/// Identity of a job: the executor that created it and its id within that executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Executor that created the job.
    pub executor_id: String,
    /// Job id, unique within the executor.
    pub job_id: String,
}

impl JobKey {
    /// Create a job key.
    pub fn new(executor_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            job_id: job_id.into(),
        }
    }

    /// Storage namespace of the job (`{executor_id}/{job_id}`).
    pub fn namespace(&self) -> String {
        format!("{}/{}", self.executor_id, self.job_id)
    }

    /// Notification topic of the job for the push monitoring strategy.
    pub fn topic(&self) -> String {
        format!("burstmap-{}-{}", self.executor_id, self.job_id)
    }

    /// Key of the call with the given id inside this job.
    pub fn call(&self, call_id: impl Into<String>) -> CallKey {
        CallKey {
            executor_id: self.executor_id.clone(),
            job_id: self.job_id.clone(),
            call_id: call_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.executor_id, self.job_id)
    }
}

/// Identity of a single call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallKey {
    /// Executor that created the call's job.
    pub executor_id: String,
    /// Job the call belongs to.
    pub job_id: String,
    /// Positional call id within the job.
    pub call_id: String,
}

impl CallKey {
    /// Create a call key.
    pub fn new(
        executor_id: impl Into<String>,
        job_id: impl Into<String>,
        call_id: impl Into<String>,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            job_id: job_id.into(),
            call_id: call_id.into(),
        }
    }

    /// Key of the job this call belongs to.
    pub fn job(&self) -> JobKey {
        JobKey::new(&self.executor_id, &self.job_id)
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.executor_id, self.job_id, self.call_id)
    }
}

/// Input of a call: inline bytes or a byte range of a shared payload object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallInput {
    /// Input bytes carried inside the invocation payload.
    Inline {
        /// Raw input bytes.
        #[serde(with = "crate::payload::base64_bytes")]
        data: Vec<u8>,
    },
    /// Input read by the worker from a storage object.
    Range {
        /// Storage key of the shared payload object.
        key: String,
        /// First byte (inclusive).
        start: u64,
        /// Last byte (exclusive).
        end: u64,
    },
}

impl CallInput {
    /// Inline input.
    pub fn inline(data: impl Into<Vec<u8>>) -> Self {
        Self::Inline { data: data.into() }
    }

    /// Inline input holding the JSON encoding of `value`.
    pub fn json(value: &serde_json::Value) -> Self {
        Self::Inline {
            data: value.to_string().into_bytes(),
        }
    }

    /// Byte range of a shared storage object.
    pub fn range(key: impl Into<String>, start: u64, end: u64) -> Self {
        Self::Range {
            key: key.into(),
            start,
            end,
        }
    }

    /// Size of the input in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Self::Inline { data } => data.len() as u64,
            Self::Range { start, end, .. } => end.saturating_sub(*start),
        }
    }
}

/// One logical unit of work within a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Positional call id.
    pub call_id: String,
    /// Input of the call.
    pub input: CallInput,
}

/// An immutable batch of calls sharing a function, runtime and timeout.
#[derive(Debug, Clone)]
pub struct Job {
    key: JobKey,
    function: Vec<u8>,
    calls: Vec<Call>,
    chunksize: usize,
    execution_timeout: Duration,
    runtime: String,
    engine_version: String,
}

impl Job {
    /// Create a job, assigning call ids in input order.
    ///
    /// `function` is the opaque work descriptor produced by the job builder;
    /// the engine routes it to the backend without inspecting it.
    pub fn new(key: JobKey, function: impl Into<Vec<u8>>, inputs: Vec<CallInput>) -> Self {
        let calls = inputs
            .into_iter()
            .enumerate()
            .map(|(i, input)| Call {
                call_id: format_call_id(i),
                input,
            })
            .collect();

        Self {
            key,
            function: function.into(),
            calls,
            chunksize: 1,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            runtime: "default".to_string(),
            engine_version: ENGINE_VERSION.to_string(),
        }
    }

    /// Set the number of calls bundled into one invocation (minimum 1).
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = chunksize.max(1);
        self
    }

    /// Set the execution timeout of every call.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Set the backend runtime the calls run in.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Override the engine version the job was built with.
    pub fn with_engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = version.into();
        self
    }

    /// Job identity.
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Opaque function descriptor.
    pub fn function(&self) -> &[u8] {
        &self.function
    }

    /// Calls in input order.
    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Number of calls.
    pub fn total_calls(&self) -> usize {
        self.calls.len()
    }

    /// Calls per invocation.
    pub fn chunksize(&self) -> usize {
        self.chunksize
    }

    /// Execution timeout of every call.
    pub fn execution_timeout(&self) -> Duration {
        self.execution_timeout
    }

    /// Backend runtime reference.
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Engine version the job was built with.
    pub fn engine_version(&self) -> &str {
        &self.engine_version
    }

    /// Index ranges of the job's chunks; the last one may be shorter.
    pub fn chunk_ranges(&self) -> Vec<Range<usize>> {
        chunk_ranges(self.calls.len(), self.chunksize)
    }
}

/// Split `total` calls into consecutive ranges of at most `chunksize`.
pub fn chunk_ranges(total: usize, chunksize: usize) -> Vec<Range<usize>> {
    let chunksize = chunksize.max(1);
    (0..total)
        .step_by(chunksize)
        .map(|start| start..(start + chunksize).min(total))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(n: usize) -> Vec<CallInput> {
        (0..n).map(|i| CallInput::inline(vec![i as u8])).collect()
    }

    #[test]
    fn test_call_ids_are_zero_padded_and_positional() {
        let job = Job::new(JobKey::new("ex", "M000"), b"fn".to_vec(), inputs(12));

        let ids: Vec<&str> = job.calls().iter().map(|c| c.call_id.as_str()).collect();
        assert_eq!(ids[0], "00000");
        assert_eq!(ids[9], "00009");
        assert_eq!(ids[11], "00011");
        assert_eq!(job.total_calls(), 12);
    }

    #[test]
    fn test_chunk_ranges_with_remainder() {
        assert_eq!(chunk_ranges(7, 3), vec![0..3, 3..6, 6..7]);
        assert_eq!(chunk_ranges(6, 3), vec![0..3, 3..6]);
        assert_eq!(chunk_ranges(2, 5), vec![0..2]);
        assert!(chunk_ranges(0, 4).is_empty());
    }

    #[test]
    fn test_zero_chunksize_is_clamped() {
        let job = Job::new(JobKey::new("ex", "M000"), Vec::new(), inputs(3)).with_chunksize(0);
        assert_eq!(job.chunksize(), 1);
        assert_eq!(job.chunk_ranges().len(), 3);
    }

    #[test]
    fn test_keys_format() {
        let job = JobKey::new("abc123", "M002");
        assert_eq!(job.namespace(), "abc123/M002");
        assert_eq!(job.topic(), "burstmap-abc123-M002");

        let call = job.call("00004");
        assert_eq!(call.to_string(), "abc123/M002/00004");
        assert_eq!(call.job(), job);
    }

    #[test]
    fn test_call_input_serialization() {
        let inline = CallInput::inline(b"hello".to_vec());
        let json = serde_json::to_value(&inline).unwrap();
        assert_eq!(json["type"], "inline");
        assert_eq!(json["data"], "aGVsbG8=");
        assert_eq!(inline.size(), 5);

        let range = CallInput::range("shared/data", 100, 164);
        let json = serde_json::to_value(&range).unwrap();
        assert_eq!(json["type"], "range");
        assert_eq!(range.size(), 64);

        let back: CallInput = serde_json::from_value(json).unwrap();
        assert_eq!(back, range);
    }

    #[test]
    fn test_job_defaults() {
        let job = Job::new(JobKey::new("ex", "A000"), b"f".to_vec(), inputs(1));
        assert_eq!(job.execution_timeout(), DEFAULT_EXECUTION_TIMEOUT);
        assert_eq!(job.runtime(), "default");
        assert_eq!(job.engine_version(), ENGINE_VERSION);
    }
}
