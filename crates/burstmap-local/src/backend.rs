// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Localhost compute backend.
//!
//! Runs each accepted chunk on a tokio task, calling functions from a
//! [`FunctionTable`]. The backend has a fixed number of worker slots; an
//! invocation arriving while every slot is busy is rejected, the way a
//! quota-limited cloud backend throttles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use burstmap_core::backend::traits::Result as BackendResult;
use burstmap_core::backend::{BackendContext, BackendError, BackendRegistry, ComputeBackend};
use burstmap_core::payload::InvocationPayload;
use burstmap_core::worker::{CallReporter, resolve_input};
use burstmap_core::{CallError, ENGINE_VERSION, Invocation, PubSub, RuntimeInfo, Storage};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::functions::{FunctionTable, LocalFunction};

/// Name the backend registers under.
pub const BACKEND_NAME: &str = "localhost";

/// Default number of worker slots.
pub const DEFAULT_WORKERS: usize = 8;

/// Default runtime timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Compute backend running functions in-process.
pub struct LocalBackend {
    storage: Arc<dyn Storage>,
    pubsub: Option<Arc<dyn PubSub>>,
    functions: Arc<FunctionTable>,
    workers: usize,
    timeout: Duration,
    active: Arc<AtomicUsize>,
    accepted: AtomicU64,
    rejected: AtomicU64,
    shutdown: CancellationToken,
}

impl LocalBackend {
    /// Create a backend with [`DEFAULT_WORKERS`] slots.
    pub fn new(storage: Arc<dyn Storage>, functions: Arc<FunctionTable>) -> Self {
        Self {
            storage,
            pubsub: None,
            functions,
            workers: DEFAULT_WORKERS,
            timeout: DEFAULT_TIMEOUT,
            active: Arc::new(AtomicUsize::new(0)),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Publish completion events on `pubsub`.
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Number of chunks that may run at once.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Runtime timeout reported to the engine.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Accepted invocations.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Invocations rejected for lack of a free slot.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::SeqCst)
    }

    /// Chunks currently running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Abandon running calls and refuse new invocations.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn reserve_slot(&self) -> Option<Slot> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.workers).then_some(n + 1)
            })
            .ok()
            .map(|_| Slot(Some(self.active.clone())))
    }
}

/// One occupied worker slot, freed on release or drop.
struct Slot(Option<Arc<AtomicUsize>>);

impl Slot {
    fn release(&mut self) {
        if let Some(active) = self.0.take() {
            active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    fn backend_type(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn runtime_info(&self, _runtime: &str) -> BackendResult<RuntimeInfo> {
        Ok(RuntimeInfo {
            max_concurrency: self.workers,
            timeout: self.timeout,
            engine_version: ENGINE_VERSION.to_string(),
        })
    }

    async fn invoke(&self, payload: &[u8]) -> BackendResult<Invocation> {
        if self.shutdown.is_cancelled() {
            return Err(BackendError::ShutDown);
        }
        let payload = InvocationPayload::decode(payload)
            .map_err(|e| BackendError::InvalidPayload(e.to_string()))?;

        let name = String::from_utf8_lossy(&payload.function).into_owned();
        let function = self.functions.get(&name).ok_or_else(|| {
            BackendError::InvocationFailed(format!("function {} is not registered", name))
        })?;

        let Some(slot) = self.reserve_slot() else {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            debug!(job = %payload.job_key(), chunk = payload.chunk_index, "All workers busy, rejecting");
            return Ok(Invocation::Rejected);
        };

        let activation_id = Uuid::new_v4().to_string();
        self.accepted.fetch_add(1, Ordering::SeqCst);
        debug!(
            job = %payload.job_key(),
            chunk = payload.chunk_index,
            calls = payload.calls.len(),
            activation_id = %activation_id,
            "Chunk accepted"
        );

        let run = ChunkRun {
            storage: self.storage.clone(),
            pubsub: self.pubsub.clone(),
            function,
            activation_id: activation_id.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(run.execute(payload, slot));

        Ok(Invocation::Accepted { activation_id })
    }
}

struct ChunkRun {
    storage: Arc<dyn Storage>,
    pubsub: Option<Arc<dyn PubSub>>,
    function: LocalFunction,
    activation_id: String,
    shutdown: CancellationToken,
}

impl ChunkRun {
    async fn execute(self, payload: InvocationPayload, mut slot: Slot) {
        let last = payload.calls.len().saturating_sub(1);
        let timeout = payload.execution_timeout();

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

            if let Err(e) = reporter.started().await {
                warn!(call = %reporter.call(), error = %e, "Failed to write init marker");
            }

            let outcome = match self.input(&payload, index).await {
                Ok(input) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            debug!(call = %reporter.call(), "Call abandoned on shutdown");
                            return;
                        }
                        result = tokio::time::timeout(timeout, (self.function)(input)) => {
                            result.unwrap_or(Err(CallError::ExecutionTimeout {
                                timeout_secs: timeout.as_secs(),
                            }))
                        }
                    }
                }
                Err(e) => Err(e),
            };

            // The slot frees when the function returns, before its status lands
            if index == last {
                slot.release();
            }

            let call = reporter.call().clone();
            let reported = match outcome {
                Ok(value) => reporter.succeeded(value).await,
                Err(e) => {
                    debug!(call = %call, error = %e, "Call failed");
                    reporter.failed(e).await
                }
            };
            if let Err(e) = reported {
                warn!(call = %call, error = %e, "Failed to report call");
            }
        }
    }

    async fn input(&self, payload: &InvocationPayload, index: usize) -> Result<Value, CallError> {
        let bytes = resolve_input(self.storage.as_ref(), &payload.calls[index].input)
            .await
            .map_err(|e| CallError::execution("InputError", e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CallError::execution("InputError", format!("input is not JSON: {}", e)))
    }
}

/// Register the `localhost` backend in `registry`.
///
/// Factory options: `workers` (slots, default [`DEFAULT_WORKERS`]) and
/// `timeout_secs` (default [`DEFAULT_TIMEOUT`]).
pub fn register(registry: &mut BackendRegistry, functions: Arc<FunctionTable>) {
    registry.register(BACKEND_NAME, move |ctx: &BackendContext| {
        let workers = ctx.option("workers", DEFAULT_WORKERS)?;
        let timeout_secs = ctx.option("timeout_secs", DEFAULT_TIMEOUT.as_secs())?;
        let mut backend = LocalBackend::new(ctx.storage.clone(), functions.clone())
            .with_workers(workers)
            .with_timeout(Duration::from_secs(timeout_secs));
        if let Some(pubsub) = &ctx.pubsub {
            backend = backend.with_pubsub(pubsub.clone());
        }
        info!(workers, timeout_secs, "Localhost backend created");
        Ok(Arc::new(backend) as Arc<dyn ComputeBackend>)
    });
}
