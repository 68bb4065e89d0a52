// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker-side reporting.
//!
//! Backends run calls and report their progress through a [`CallReporter`],
//! which writes the init marker, output and status documents in the per-call
//! key layout and mirrors them as [`CompletionEvent`]s on the job topic. Both
//! monitoring strategies therefore observe the same data.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{CallError, Result};
use crate::job::{CallInput, CallKey};
use crate::payload::InvocationPayload;
use crate::pubsub::PubSub;
use crate::status::{CallOutput, CallStatus, CompletionEvent};
use crate::storage::{self, Storage, StorageError};

/// Load the bytes of a call input, reading range inputs from storage.
pub async fn resolve_input(storage: &dyn Storage, input: &CallInput) -> Result<Vec<u8>> {
    match input {
        CallInput::Inline { data } => Ok(data.clone()),
        CallInput::Range { key, start, end } => {
            let object = storage.get(key).await?.ok_or_else(|| {
                StorageError::Other(format!("shared payload object {} not found", key))
            })?;
            let len = object.len() as u64;
            if start > end || *end > len {
                return Err(StorageError::Other(format!(
                    "range {}..{} out of bounds for {} ({} bytes)",
                    start, end, key, len
                ))
                .into());
            }
            Ok(object[*start as usize..*end as usize].to_vec())
        }
    }
}

/// Reports the lifecycle of one call.
pub struct CallReporter {
    storage: Arc<dyn Storage>,
    pubsub: Option<Arc<dyn PubSub>>,
    topic: Option<String>,
    call: CallKey,
    activation_id: Option<String>,
    start_time: DateTime<Utc>,
    input_size: u64,
}

impl CallReporter {
    /// Create a reporter for the call at `index` of `payload`.
    ///
    /// Returns `None` when the payload has no call at `index`.
    pub fn for_payload(
        storage: Arc<dyn Storage>,
        pubsub: Option<Arc<dyn PubSub>>,
        payload: &InvocationPayload,
        index: usize,
        activation_id: Option<String>,
    ) -> Option<Self> {
        let call = payload.call_key(index)?;
        let input_size = payload.calls[index].input.size();
        Some(Self {
            storage,
            pubsub,
            topic: payload.notify_topic.clone(),
            call,
            activation_id,
            start_time: Utc::now(),
            input_size,
        })
    }

    /// Create a reporter for a call spawned by a worker (dynamic fan-out).
    pub fn for_call(
        storage: Arc<dyn Storage>,
        pubsub: Option<Arc<dyn PubSub>>,
        call: CallKey,
        activation_id: Option<String>,
    ) -> Self {
        let topic = pubsub.as_ref().map(|_| call.job().topic());
        Self {
            storage,
            pubsub,
            topic,
            call,
            activation_id,
            start_time: Utc::now(),
            input_size: 0,
        }
    }

    /// The call being reported.
    pub fn call(&self) -> &CallKey {
        &self.call
    }

    /// Record that the call started executing.
    pub async fn started(&mut self) -> Result<()> {
        self.start_time = Utc::now();
        let event = CompletionEvent::init(self.call.clone(), self.activation_id.clone());
        let body = event.encode()?;
        self.storage
            .put(&storage::init_key(&self.call), body.clone())
            .await?;
        self.publish(body).await?;
        debug!(call = %self.call, "Call started");
        Ok(())
    }

    /// Record a successful call returning `value`.
    pub async fn succeeded(self, value: serde_json::Value) -> Result<()> {
        let output = CallOutput::Value { value }.encode()?;
        self.finish(Some(output), None, Vec::new()).await
    }

    /// Record a call that spawned further calls whose results replace its own.
    pub async fn spawned(self, futures: Vec<CallKey>) -> Result<()> {
        let output = CallOutput::Futures {
            futures: futures.clone(),
        }
        .encode()?;
        self.finish(Some(output), None, futures).await
    }

    /// Record a failed call.
    pub async fn failed(self, error: CallError) -> Result<()> {
        self.finish(None, Some(error), Vec::new()).await
    }

    async fn finish(
        self,
        output: Option<Vec<u8>>,
        error: Option<CallError>,
        new_futures: Vec<CallKey>,
    ) -> Result<()> {
        let output_size = output.as_ref().map(|o| o.len() as u64).unwrap_or(0);
        // Output before status: a visible status implies a written output
        if let Some(output) = output {
            self.storage
                .put(&storage::output_key(&self.call), output)
                .await?;
        }

        let status = CallStatus {
            executor_id: self.call.executor_id.clone(),
            job_id: self.call.job_id.clone(),
            call_id: self.call.call_id.clone(),
            activation_id: self.activation_id.clone(),
            exception: error.is_some(),
            error,
            start_time: self.start_time,
            end_time: Utc::now(),
            input_size: self.input_size,
            output_size,
            new_futures,
        };
        self.storage
            .put(&storage::status_key(&self.call), status.encode()?)
            .await?;

        debug!(call = %self.call, exception = status.exception, "Call finished");
        let body = CompletionEvent::end(status).encode()?;
        self.publish(body).await
    }

    async fn publish(&self, body: Vec<u8>) -> Result<()> {
        if let (Some(pubsub), Some(topic)) = (&self.pubsub, &self.topic) {
            pubsub.publish(topic, body).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobKey};
    use crate::storage::MemoryStorage;

    fn payload() -> InvocationPayload {
        let job = Job::new(
            JobKey::new("ex", "M000"),
            b"f".to_vec(),
            vec![CallInput::inline(b"12".to_vec())],
        );
        InvocationPayload::for_chunk(&job, 0, 0..1, None)
    }

    #[tokio::test]
    async fn test_reporter_writes_documents() {
        let storage = MemoryStorage::new();
        let mut reporter = CallReporter::for_payload(
            Arc::new(storage.clone()),
            None,
            &payload(),
            0,
            Some("act".into()),
        )
        .unwrap();

        reporter.started().await.unwrap();
        reporter.succeeded(serde_json::json!(144)).await.unwrap();

        let keys = storage.list_keys("ex/M000/00000/").await.unwrap();
        assert_eq!(keys.len(), 3);

        let status = storage.get("ex/M000/00000/status").await.unwrap().unwrap();
        let status = CallStatus::decode(&status).unwrap();
        assert!(!status.exception);
        assert_eq!(status.input_size, 2);
        assert_eq!(status.activation_id.as_deref(), Some("act"));
        assert!(status.output_size > 0);
    }

    #[tokio::test]
    async fn test_failed_call_has_no_output() {
        let storage = MemoryStorage::new();
        let reporter =
            CallReporter::for_payload(Arc::new(storage.clone()), None, &payload(), 0, None)
                .unwrap();

        reporter
            .failed(CallError::execution("ValueError", "bad input"))
            .await
            .unwrap();

        assert!(storage.get("ex/M000/00000/output").await.unwrap().is_none());
        let status = storage.get("ex/M000/00000/status").await.unwrap().unwrap();
        let failure = CallStatus::decode(&status).unwrap().failure().unwrap();
        assert_eq!(failure, CallError::execution("ValueError", "bad input"));
    }

    #[tokio::test]
    async fn test_resolve_range_input() {
        let storage = MemoryStorage::new();
        storage.put("shared", b"abcdefgh".to_vec()).await.unwrap();

        let bytes = resolve_input(&storage, &CallInput::range("shared", 2, 5))
            .await
            .unwrap();
        assert_eq!(bytes, b"cde");

        assert!(resolve_input(&storage, &CallInput::range("shared", 4, 20))
            .await
            .is_err());
        assert!(resolve_input(&storage, &CallInput::range("missing", 0, 1))
            .await
            .is_err());
    }

    #[test]
    fn test_reporter_index_out_of_range() {
        let reporter =
            CallReporter::for_payload(Arc::new(MemoryStorage::new()), None, &payload(), 3, None);
        assert!(reporter.is_none());
    }
}
