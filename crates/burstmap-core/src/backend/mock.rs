// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Executes calls on tokio tasks with a scripted handler and reports through
//! a [`CallReporter`], so the engine observes a mock run exactly as it would
//! observe a real backend. Quota rejections, invocation failures, hung calls
//! and dynamic fan-out can all be scripted.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::traits::*;
use crate::ENGINE_VERSION;
use crate::error::CallError;
use crate::job::{CallKey, format_call_id};
use crate::payload::InvocationPayload;
use crate::pubsub::PubSub;
use crate::storage::Storage;
use crate::worker::{CallReporter, resolve_input};

/// A call as seen by a mock handler.
#[derive(Debug, Clone)]
pub struct MockCall {
    /// Identity of the call.
    pub call: CallKey,
    /// Resolved input bytes.
    pub input: Vec<u8>,
    /// Function descriptor of the job.
    pub function: Vec<u8>,
}

impl MockCall {
    /// The input parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.input).ok()
    }
}

/// What a mock call does.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Return a value.
    Value(Value),
    /// Raise an error.
    Fail {
        /// Error type name.
        error_type: String,
        /// Error message.
        message: String,
    },
    /// Never finish (until the mock is shut down, and then without reporting).
    Hang,
    /// Wait, then behave like the inner outcome.
    Delay(Duration, Box<MockOutcome>),
    /// Spawn one nested call per outcome; their results replace this call's value.
    Spawn(Vec<MockOutcome>),
}

impl MockOutcome {
    /// Return `value`.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    /// Raise `error_type: message`.
    pub fn fail(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Behave like `self` after `delay`.
    pub fn after(self, delay: Duration) -> Self {
        Self::Delay(delay, Box::new(self))
    }
}

/// Handler deciding the outcome of each mock call.
pub type MockHandler = Arc<dyn Fn(&MockCall) -> MockOutcome + Send + Sync>;

#[derive(Default)]
struct MockStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    forced_rejections: AtomicU64,
    calls_started: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Mock compute backend.
pub struct MockBackend {
    storage: Arc<dyn Storage>,
    pubsub: Option<Arc<dyn PubSub>>,
    handler: MockHandler,
    max_concurrency: usize,
    timeout: Duration,
    engine_version: String,
    fail_invocations: bool,
    stats: Arc<MockStats>,
    shutdown: CancellationToken,
}

impl MockBackend {
    /// Create a mock backend that echoes its (JSON) inputs.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            pubsub: None,
            handler: Arc::new(echo),
            max_concurrency: 1000,
            timeout: Duration::from_secs(900),
            engine_version: ENGINE_VERSION.to_string(),
            fail_invocations: false,
            stats: Arc::new(MockStats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Also publish completion events on `pubsub`.
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Decide call outcomes with `handler`.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&MockCall) -> MockOutcome + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    /// Reject invocations while `max` invocations are active.
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Runtime timeout reported by `runtime_info`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Engine version reported by `runtime_info`.
    pub fn with_engine_version(mut self, version: impl Into<String>) -> Self {
        self.engine_version = version.into();
        self
    }

    /// Reject the first `n` invocations regardless of load.
    pub fn with_forced_rejections(self, n: u64) -> Self {
        self.stats.forced_rejections.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every invocation with an irrecoverable error.
    pub fn failing_invocations(mut self) -> Self {
        self.fail_invocations = true;
        self
    }

    /// Accepted invocations.
    pub fn invocation_count(&self) -> u64 {
        self.stats.accepted.load(Ordering::SeqCst)
    }

    /// Rejected invocations.
    pub fn rejection_count(&self) -> u64 {
        self.stats.rejected.load(Ordering::SeqCst)
    }

    /// Calls that started executing (nested calls excluded).
    pub fn calls_started(&self) -> u64 {
        self.stats.calls_started.load(Ordering::SeqCst)
    }

    /// Invocations currently executing.
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously executing invocations seen.
    pub fn peak_active(&self) -> usize {
        self.stats.peak_active.load(Ordering::SeqCst)
    }

    /// Stop hung calls. Further invocations fail.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn take_forced_rejection(&self) -> bool {
        self.stats
            .forced_rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn reserve_slot(&self) -> bool {
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        if active > self.max_concurrency {
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        self.stats.peak_active.fetch_max(active, Ordering::SeqCst);
        true
    }
}

fn echo(call: &MockCall) -> MockOutcome {
    match call.json() {
        Some(value) => MockOutcome::Value(value),
        None => MockOutcome::Value(Value::String(
            String::from_utf8_lossy(&call.input).into_owned(),
        )),
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn runtime_info(&self, _runtime: &str) -> Result<RuntimeInfo> {
        Ok(RuntimeInfo {
            max_concurrency: self.max_concurrency,
            timeout: self.timeout,
            engine_version: self.engine_version.clone(),
        })
    }

    async fn invoke(&self, payload: &[u8]) -> Result<Invocation> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::ShutDown);
        }
        if self.fail_invocations {
            return Err(BackendError::InvocationFailed(
                "mock backend configured to fail invocations".to_string(),
            ));
        }

        let payload = InvocationPayload::decode(payload)
            .map_err(|e| BackendError::InvalidPayload(e.to_string()))?;

        if self.take_forced_rejection() || !self.reserve_slot() {
            self.stats.rejected.fetch_add(1, Ordering::SeqCst);
            debug!(job = %payload.job_key(), chunk = payload.chunk_index, "Mock rejected invocation");
            return Ok(Invocation::Rejected);
        }

        self.stats.accepted.fetch_add(1, Ordering::SeqCst);
        let activation_id = uuid::Uuid::new_v4().to_string();

        let run = ChunkRun {
            storage: self.storage.clone(),
            pubsub: self.pubsub.clone(),
            handler: self.handler.clone(),
            stats: self.stats.clone(),
            shutdown: self.shutdown.clone(),
            activation_id: activation_id.clone(),
        };
        tokio::spawn(run.execute(payload));

        Ok(Invocation::Accepted { activation_id })
    }
}

/// Terminal result of a mock call.
enum Settled {
    Value(Value),
    Fail(CallError),
    Spawn(Vec<MockOutcome>),
    Abandoned,
}

async fn settle(mut outcome: MockOutcome, shutdown: &CancellationToken) -> Settled {
    loop {
        match outcome {
            MockOutcome::Value(v) => return Settled::Value(v),
            MockOutcome::Fail {
                error_type,
                message,
            } => return Settled::Fail(CallError::execution(error_type, message)),
            MockOutcome::Spawn(children) => return Settled::Spawn(children),
            MockOutcome::Hang => {
                shutdown.cancelled().await;
                return Settled::Abandoned;
            }
            MockOutcome::Delay(delay, inner) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return Settled::Abandoned,
                    _ = tokio::time::sleep(delay) => outcome = *inner,
                }
            }
        }
    }
}

/// One accepted invocation running on a tokio task.
struct ChunkRun {
    storage: Arc<dyn Storage>,
    pubsub: Option<Arc<dyn PubSub>>,
    handler: MockHandler,
    stats: Arc<MockStats>,
    shutdown: CancellationToken,
    activation_id: String,
}

impl ChunkRun {
    async fn execute(self, payload: InvocationPayload) {
        let last = payload.calls.len().saturating_sub(1);
        let mut slot_held = true;

        for index in 0..payload.calls.len() {
            let Some(mut reporter) = CallReporter::for_payload(
                self.storage.clone(),
                self.pubsub.clone(),
                &payload,
                index,
                Some(self.activation_id.clone()),
            ) else {
                continue;
            };

            self.stats.calls_started.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = reporter.started().await {
                warn!(call = %reporter.call(), error = %e, "Mock failed to write init marker");
            }

            let settled = match resolve_input(self.storage.as_ref(), &payload.calls[index].input)
                .await
            {
                Ok(input) => {
                    let call = MockCall {
                        call: reporter.call().clone(),
                        input,
                        function: payload.function.clone(),
                    };
                    settle((self.handler)(&call), &self.shutdown).await
                }
                Err(e) => Settled::Fail(CallError::execution("InputError", e.to_string())),
            };

            // The backend slot frees when the function returns, before its status lands
            if index == last {
                self.stats.active.fetch_sub(1, Ordering::SeqCst);
                slot_held = false;
            }

            if let Err(e) = self.report(reporter, settled).await {
                warn!(error = %e, "Mock failed to report call");
            }
        }

        if slot_held {
            self.stats.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn report(&self, reporter: CallReporter, settled: Settled) -> crate::error::Result<()> {
        match settled {
            Settled::Value(v) => reporter.succeeded(v).await,
            Settled::Fail(e) => reporter.failed(e).await,
            Settled::Abandoned => Ok(()),
            Settled::Spawn(children) => {
                let parent = reporter.call().clone();
                let child_job = format!("{}-{}", parent.job_id, parent.call_id);
                let keys: Vec<CallKey> = (0..children.len())
                    .map(|i| CallKey::new(&parent.executor_id, &child_job, format_call_id(i)))
                    .collect();

                for (key, outcome) in keys.iter().cloned().zip(children) {
                    let child = CallReporter::for_call(
                        self.storage.clone(),
                        self.pubsub.clone(),
                        key,
                        Some(self.activation_id.clone()),
                    );
                    let shutdown = self.shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = run_nested(child, outcome, shutdown).await {
                            warn!(error = %e, "Mock failed to report nested call");
                        }
                    });
                }

                reporter.spawned(keys).await
            }
        }
    }
}

async fn run_nested(
    mut child: CallReporter,
    outcome: MockOutcome,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    child.started().await?;
    match settle(outcome, &shutdown).await {
        Settled::Value(v) => child.succeeded(v).await,
        Settled::Fail(e) => child.failed(e).await,
        // Nested spawning is one level deep in the mock
        Settled::Spawn(_) => {
            child
                .failed(CallError::execution(
                    "MockError",
                    "nested spawn is not supported",
                ))
                .await
        }
        Settled::Abandoned => Ok(()),
    }
}
