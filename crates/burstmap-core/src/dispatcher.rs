// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job dispatcher.
//!
//! Turns a [`Job`] into invocations against the compute backend:
//!
//! 1. Check the backend runtime speaks the job's engine version.
//! 2. Create one [`CallFuture`] per call and register a completion watch.
//! 3. **Direct lane**: every admission token free right now takes one chunk,
//!    invoked concurrently (bounded by `direct_invoke_parallelism`) before
//!    `dispatch` returns.
//! 4. **Deferred lane**: remaining chunks go to a per-job queue served by
//!    `invoker_workers` background tasks. Each task blocks for a token, pops a
//!    chunk and invokes it. A rejected chunk gives its token back, waits a
//!    randomized backoff and is queued again whole.
//!
//! An irrecoverable backend error aborts the job: every call not yet accepted
//! by the backend fails with [`CallError::DispatchFailed`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionController, AdmissionToken};
use crate::backend::{BackendError, ComputeBackend, Invocation};
use crate::config::{EngineConfig, MonitorStrategy};
use crate::error::{CallError, Error, Result};
use crate::future::CallFuture;
use crate::job::{CallKey, Job, JobKey};
use crate::ledger::InvocationLedger;
use crate::monitor::CompletionMonitor;
use crate::payload::InvocationPayload;
use crate::storage::Storage;

/// One physical invocation: a run of consecutive calls.
struct Chunk {
    index: usize,
    payload: Arc<[u8]>,
    futures: Vec<CallFuture>,
    keys: Vec<CallKey>,
}

impl Chunk {
    fn fail(&self, reason: &str) {
        for future in &self.futures {
            if !future.is_done() {
                future.mark_failed(CallError::DispatchFailed {
                    reason: reason.to_string(),
                });
            }
        }
    }
}

enum InvokeOutcome {
    Invoked,
    Rejected(Chunk),
    Failed(BackendError, Chunk),
}

/// Chunks of one job waiting for the deferred lane.
///
/// `pending` counts chunks not yet accepted by the backend; the queue is
/// exhausted once it reaches zero.
struct DeferredQueue {
    chunks: Mutex<VecDeque<Chunk>>,
    pending: AtomicUsize,
    notify: Notify,
}

impl DeferredQueue {
    fn new(chunks: VecDeque<Chunk>) -> Self {
        Self {
            pending: AtomicUsize::new(chunks.len()),
            chunks: Mutex::new(chunks),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Chunk>> {
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Next chunk, or `None` once every chunk was invoked or the queue drained.
    async fn pop(&self) -> Option<Chunk> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.lock().pop_front() {
                return Some(chunk);
            }
            if self.pending.load(Ordering::SeqCst) == 0 {
                return None;
            }
            notified.await;
        }
    }

    fn push_back(&self, chunk: Chunk) {
        self.lock().push_back(chunk);
        self.notify.notify_one();
    }

    fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    fn drain(&self) -> Vec<Chunk> {
        let drained: Vec<Chunk> = self.lock().drain(..).collect();
        self.pending.store(0, Ordering::SeqCst);
        self.notify.notify_waiters();
        drained
    }
}

/// Deferred-lane state of one job.
struct JobRun {
    key: JobKey,
    queue: DeferredQueue,
    cancel: CancellationToken,
    abort_reason: Mutex<Option<String>>,
    workers: AtomicUsize,
}

impl JobRun {
    fn reason(&self) -> String {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "dispatch cancelled".to_string())
    }

    /// Stop the job's invokers and fail every call not yet invoked.
    fn abort(&self, reason: &str, held: Option<Chunk>) {
        self.abort_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_or_insert_with(|| reason.to_string());
        self.cancel.cancel();

        let reason = self.reason();
        if let Some(chunk) = held {
            chunk.fail(&reason);
        }
        for chunk in self.queue.drain() {
            chunk.fail(&reason);
        }
    }
}

struct DispatcherInner {
    backend: Arc<dyn ComputeBackend>,
    storage: Arc<dyn Storage>,
    admission: AdmissionController,
    monitor: CompletionMonitor,
    ledger: Arc<InvocationLedger>,
    config: EngineConfig,
    jobs: Mutex<HashMap<JobKey, Arc<JobRun>>>,
    shutdown: CancellationToken,
}

impl DispatcherInner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<JobRun>>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn invoke_chunk(&self, chunk: Chunk, token: AdmissionToken) -> InvokeOutcome {
        // Registered first: the call may finish before `invoke` returns
        let id = self.ledger.register(&chunk.keys, token);

        match self.backend.invoke(&chunk.payload).await {
            Ok(Invocation::Accepted { activation_id }) => {
                for future in &chunk.futures {
                    future.mark_invoked(&activation_id);
                }
                debug!(
                    job = %chunk.futures[0].job_key(),
                    chunk = chunk.index,
                    calls = chunk.futures.len(),
                    activation_id = %activation_id,
                    "Chunk invoked"
                );
                InvokeOutcome::Invoked
            }
            Ok(Invocation::Rejected) => {
                self.ledger.revoke(id);
                InvokeOutcome::Rejected(chunk)
            }
            Err(e) => {
                self.ledger.revoke(id);
                InvokeOutcome::Failed(e, chunk)
            }
        }
    }

    fn rejection_backoff(&self) -> Duration {
        let min = self.config.rejection_backoff_min.as_millis() as u64;
        let max = self.config.rejection_backoff_max.as_millis() as u64;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Dispatches jobs to the compute backend under admission control.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(
        backend: Arc<dyn ComputeBackend>,
        storage: Arc<dyn Storage>,
        admission: AdmissionController,
        monitor: CompletionMonitor,
        ledger: Arc<InvocationLedger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                backend,
                storage,
                admission,
                monitor,
                ledger,
                config,
                jobs: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Admission controller tokens are drawn from.
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Completion monitor watching dispatched jobs.
    pub fn monitor(&self) -> &CompletionMonitor {
        &self.inner.monitor
    }

    /// Dispatch `job`, returning one future per call in call-id order.
    ///
    /// Returns once the direct lane has been invoked; the deferred lane keeps
    /// running in the background. Fails with [`Error::ProtocolMismatch`]
    /// before anything is admitted when the backend runtime was built for a
    /// different engine version, and with [`Error::Backend`] when the direct
    /// lane hits an irrecoverable backend error (the job is aborted then).
    pub async fn dispatch(&self, job: &Job) -> Result<Vec<CallFuture>> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }
        let key = job.key().clone();

        let info = inner.backend.runtime_info(job.runtime()).await?;
        if info.engine_version != job.engine_version() {
            error!(
                job = %key,
                local = job.engine_version(),
                runtime = %info.engine_version,
                "Engine version mismatch, job not dispatched"
            );
            return Err(Error::ProtocolMismatch {
                local: job.engine_version().to_string(),
                runtime: info.engine_version,
            });
        }

        let timeout = if job.execution_timeout() > info.timeout {
            warn!(
                job = %key,
                requested_secs = job.execution_timeout().as_secs(),
                runtime_secs = info.timeout.as_secs(),
                "Execution timeout exceeds runtime limit, clamping"
            );
            info.timeout
        } else {
            job.execution_timeout()
        };

        let futures: Vec<CallFuture> = job
            .calls()
            .iter()
            .map(|call| {
                CallFuture::new(
                    key.call(&call.call_id),
                    inner.storage.clone(),
                    &inner.config,
                    timeout,
                )
            })
            .collect();
        if futures.is_empty() {
            return Ok(futures);
        }

        let notify_topic = (inner.monitor.strategy() == MonitorStrategy::Push).then(|| key.topic());
        let mut chunks = VecDeque::new();
        for (index, range) in job.chunk_ranges().into_iter().enumerate() {
            let mut payload =
                InvocationPayload::for_chunk(job, index, range.clone(), notify_topic.clone());
            payload.execution_timeout_secs = timeout.as_secs();
            let chunk_futures = futures[range].to_vec();
            chunks.push_back(Chunk {
                index,
                payload: payload.encode()?.into(),
                keys: chunk_futures.iter().map(|f| f.key().clone()).collect(),
                futures: chunk_futures,
            });
        }

        // Watch before the first invocation so no completion can be missed
        let _events = inner.monitor.observe(&key, futures.clone()).await?;

        info!(
            job = %key,
            calls = futures.len(),
            chunks = chunks.len(),
            chunksize = job.chunksize(),
            "Dispatching job"
        );

        let mut direct = Vec::new();
        while !chunks.is_empty() {
            let Some(token) = inner.admission.try_acquire() else {
                break;
            };
            if let Some(chunk) = chunks.pop_front() {
                direct.push((chunk, token));
            }
        }
        let direct_chunks = direct.len();

        let outcomes: Vec<InvokeOutcome> = stream::iter(direct)
            .map(|(chunk, token)| inner.invoke_chunk(chunk, token))
            .buffer_unordered(inner.config.direct_invoke_parallelism.max(1))
            .collect()
            .await;

        let mut rejected = Vec::new();
        let mut failed = Vec::new();
        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                InvokeOutcome::Invoked => {}
                InvokeOutcome::Rejected(chunk) => rejected.push(chunk),
                InvokeOutcome::Failed(e, chunk) => {
                    failed.push(chunk);
                    failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = failure {
            let reason = e.to_string();
            error!(job = %key, error = %e, "Invocation failed, aborting job");
            for chunk in failed.iter().chain(&rejected).chain(&chunks) {
                chunk.fail(&reason);
            }
            return Err(Error::Backend(e));
        }

        let rejected_direct = rejected.len();
        rejected.sort_by_key(|c| c.index);
        for chunk in rejected.into_iter().rev() {
            chunks.push_front(chunk);
        }

        debug!(
            job = %key,
            direct = direct_chunks - rejected_direct,
            deferred = chunks.len(),
            "Direct lane invoked"
        );

        if !chunks.is_empty() {
            self.start_deferred(key, chunks);
        }
        Ok(futures)
    }

    fn start_deferred(&self, key: JobKey, chunks: VecDeque<Chunk>) {
        let workers = self.inner.config.invoker_workers.max(1).min(chunks.len());
        let run = Arc::new(JobRun {
            key: key.clone(),
            queue: DeferredQueue::new(chunks),
            cancel: self.inner.shutdown.child_token(),
            abort_reason: Mutex::new(None),
            workers: AtomicUsize::new(workers),
        });

        if let Some(previous) = self.inner.jobs().insert(key, run.clone()) {
            previous.abort("job replaced", None);
        }

        for worker in 0..workers {
            tokio::spawn(invoker_loop(self.inner.clone(), run.clone(), worker));
        }
    }

    /// Stop dispatching `job`: drain its queue, fail calls not yet invoked
    /// and detach its completion watch.
    ///
    /// Calls already accepted by the backend keep their admission tokens
    /// until the detached watch sees them end or time out.
    pub fn stop_job(&self, job: &JobKey) {
        let run = self.inner.jobs().remove(job);
        if let Some(run) = run {
            run.abort("dispatch cancelled", None);
        }
        self.inner.monitor.stop_job(job);
        info!(
            job = %job,
            outstanding_invocations = self.inner.ledger.outstanding(),
            "Job stopped"
        );
    }

    /// Jobs whose deferred lane is still running.
    pub fn active_jobs(&self) -> usize {
        self.inner.jobs().len()
    }

    /// Stop every job, close admission and stop the monitor.
    pub fn shutdown(&self) {
        let runs: Vec<Arc<JobRun>> = self.inner.jobs().drain().map(|(_, run)| run).collect();
        for run in runs {
            run.abort("executor shut down", None);
        }
        self.inner.shutdown.cancel();
        self.inner.admission.shutdown();
        self.inner.monitor.shutdown();
    }
}

async fn invoker_loop(inner: Arc<DispatcherInner>, run: Arc<JobRun>, worker: usize) {
    debug!(job = %run.key, worker, "Invoker started");

    loop {
        let token = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => break,
            admission = inner.admission.acquire() => match admission {
                Admission::Token(token) => token,
                Admission::Shutdown => {
                    run.abort("admission shut down", None);
                    break;
                }
            },
        };

        let chunk = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => break,
            chunk = run.queue.pop() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };

        match inner.invoke_chunk(chunk, token).await {
            InvokeOutcome::Invoked => run.queue.complete_one(),
            InvokeOutcome::Rejected(chunk) => {
                let backoff = inner.rejection_backoff();
                debug!(
                    job = %run.key,
                    chunk = chunk.index,
                    backoff_ms = backoff.as_millis() as u64,
                    "Invocation rejected, backing off"
                );
                tokio::select! {
                    biased;
                    _ = run.cancel.cancelled() => {
                        chunk.fail(&run.reason());
                        break;
                    }
                    _ = tokio::time::sleep(backoff) => run.queue.push_back(chunk),
                }
            }
            InvokeOutcome::Failed(e, chunk) => {
                error!(job = %run.key, chunk = chunk.index, error = %e, "Invocation failed, aborting job");
                run.abort(&e.to_string(), Some(chunk));
                break;
            }
        }
    }

    if run.workers.fetch_sub(1, Ordering::SeqCst) == 1 {
        // Last invoker out: whatever is left was never invoked
        let reason = run.reason();
        for chunk in run.queue.drain() {
            chunk.fail(&reason);
        }
        let mut jobs = inner.jobs();
        if jobs.get(&run.key).is_some_and(|r| Arc::ptr_eq(r, &run)) {
            jobs.remove(&run.key);
        }
        drop(jobs);
        debug!(job = %run.key, "Deferred lane finished");
    }
}
