// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call futures.
//!
//! A [`CallFuture`] is a cheap, cloneable handle to the shared state of one
//! call. The dispatcher and the completion monitor move it forward through
//! its lifecycle; callers read it through [`CallFuture::status`] and
//! [`CallFuture::result`].
//!
//! ```text
//! New -> Invoked -> Running -> Ready -> Success
//!                                   \-> Futures
//!    (any non-terminal state)    ----> Error
//! ```
//!
//! State only moves forward. Retrieval is memoized: the first reader pays
//! the polling cost, every later (or concurrent) reader gets the cached
//! document. A reader that gives up waiting gets a timeout outcome that is
//! neither cached nor reflected in the state; settling a call as timed out
//! is left to the completion monitor.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{OnceCell, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{CallError, Error, Result};
use crate::job::{CallKey, JobKey};
use crate::status::{CallOutput, CallStatus};
use crate::storage::{self, Storage, StorageError};

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Created, not yet accepted by the backend.
    New,
    /// Accepted by the backend.
    Invoked,
    /// The backend reported that the call started.
    Running,
    /// The call finished; its status document is available.
    Ready,
    /// The call produced a value.
    Success,
    /// The call produced further calls whose results replace its own.
    Futures,
    /// The call failed, timed out, or was never dispatched.
    Error,
}

impl CallState {
    fn rank(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Invoked => 1,
            Self::Running => 2,
            Self::Ready => 3,
            Self::Success | Self::Futures | Self::Error => 4,
        }
    }

    /// Whether the call finished (its outcome can be retrieved without waiting on the backend).
    pub fn is_done(self) -> bool {
        self.rank() >= Self::Ready.rank()
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        self.rank() == 4
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Invoked => "invoked",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Success => "success",
            Self::Futures => "futures",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Outcome of a call as returned by [`CallFuture::result`].
#[derive(Debug, Clone)]
pub enum CallResult {
    /// The value returned by the call.
    Value(serde_json::Value),
    /// Calls spawned by this call; their results stand in for its value.
    Futures(Vec<CallFuture>),
    /// Why the call has no value.
    Error(CallError),
}

impl CallResult {
    /// The plain value, if any.
    pub fn value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// The failure, if any.
    pub fn error(&self) -> Option<&CallError> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the call failed.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Retrieval counters and timing of a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStats {
    /// Blocking status retrievals performed (more than one only after a failed or abandoned one).
    pub status_retrievals: u32,
    /// Storage lookups made for the status document.
    pub status_polls: u32,
    /// Blocking output retrievals performed.
    pub output_retrievals: u32,
    /// Storage lookups made for the output document.
    pub output_polls: u32,
    /// When the backend accepted the call.
    pub invoked_at: Option<DateTime<Utc>>,
    /// When the monitor saw the call start.
    pub started_at: Option<DateTime<Utc>>,
    /// When the monitor saw the call end.
    pub finished_at: Option<DateTime<Utc>>,
    /// Worker-side execution time in milliseconds.
    pub worker_duration_ms: Option<i64>,
    /// Size of the output document in bytes.
    pub output_size: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Retrieval {
    status_interval: Duration,
    status_attempts: u32,
    result_interval: Duration,
    result_attempts: u32,
    execution_timeout: Duration,
    timeout_grace: Duration,
}

impl Retrieval {
    /// How long a reader waits for the status document, measured from the
    /// start of the call's execution clock.
    fn status_budget(&self) -> Duration {
        self.execution_timeout
            + self.timeout_grace
            + self.status_interval.saturating_mul(self.status_attempts)
    }
}

/// Why a retrieval produced nothing to memoize.
enum Unsettled {
    Failed(Error),
    /// The reader stopped waiting; the call may still finish.
    Expired(CallError),
}

impl From<Error> for Unsettled {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

impl From<StorageError> for Unsettled {
    fn from(e: StorageError) -> Self {
        Self::Failed(e.into())
    }
}

#[derive(Default)]
struct Shared {
    activation_id: Option<String>,
    /// Start of the execution clock: invocation, restarted when the call starts.
    clock: Option<Instant>,
    delivered: Option<CallStatus>,
    children: Vec<CallFuture>,
    stats: CallStats,
}

struct Inner {
    key: CallKey,
    storage: Arc<dyn Storage>,
    retrieval: Retrieval,
    state: watch::Sender<CallState>,
    status: OnceCell<CallStatus>,
    result: OnceCell<CallResult>,
    shared: Mutex<Shared>,
}

/// Shared handle to one call.
#[derive(Clone)]
pub struct CallFuture {
    inner: Arc<Inner>,
}

impl fmt::Debug for CallFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFuture")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .finish()
    }
}

impl CallFuture {
    /// Create a future for `key` in state `New`.
    pub fn new(
        key: CallKey,
        storage: Arc<dyn Storage>,
        config: &EngineConfig,
        execution_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(CallState::New);
        Self {
            inner: Arc::new(Inner {
                key,
                storage,
                retrieval: Retrieval {
                    status_interval: config.status_poll_interval,
                    status_attempts: config.status_max_attempts,
                    result_interval: config.result_poll_interval,
                    result_attempts: config.result_max_attempts,
                    execution_timeout,
                    timeout_grace: config.timeout_grace,
                },
                state,
                status: OnceCell::new(),
                result: OnceCell::new(),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    /// Create a future for a call spawned by this one.
    pub(crate) fn child(&self, key: CallKey) -> Self {
        let (state, _) = watch::channel(CallState::New);
        Self {
            inner: Arc::new(Inner {
                key,
                storage: self.inner.storage.clone(),
                retrieval: self.inner.retrieval,
                state,
                status: OnceCell::new(),
                result: OnceCell::new(),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    /// Identity of the call.
    pub fn key(&self) -> &CallKey {
        &self.inner.key
    }

    /// Positional call id.
    pub fn call_id(&self) -> &str {
        &self.inner.key.call_id
    }

    /// Identity of the call's job.
    pub fn job_key(&self) -> JobKey {
        self.inner.key.job()
    }

    /// Execution timeout of the call's job.
    pub fn execution_timeout(&self) -> Duration {
        self.inner.retrieval.execution_timeout
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CallState {
        *self.inner.state.borrow()
    }

    /// Whether the call finished.
    pub fn is_done(&self) -> bool {
        self.state().is_done()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.inner.state.subscribe()
    }

    /// Backend activation that ran the call, once invoked.
    pub fn activation_id(&self) -> Option<String> {
        self.lock().activation_id.clone()
    }

    /// Snapshot of the retrieval counters and timings.
    pub fn stats(&self) -> CallStats {
        self.lock().stats.clone()
    }

    /// Calls spawned by this call, once known.
    pub fn children(&self) -> Vec<CallFuture> {
        self.lock().children.clone()
    }

    /// Whether both handles refer to the same call state.
    pub fn same_as(&self, other: &CallFuture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Calls cannot be cancelled once created.
    pub fn cancel(&self) -> Result<()> {
        Err(Error::UnsupportedOperation(
            "cancelling an individual call is not supported",
        ))
    }

    /// Status document of the call.
    ///
    /// The first caller polls storage (or uses the document delivered by the
    /// monitor); later callers get the memoized document. Failures are raised
    /// as [`Error::Call`] when `throw_on_error` is set and returned as a
    /// status document with `exception` set otherwise.
    ///
    /// A reader waits until the execution timeout, the timeout grace and
    /// `status_max_attempts` poll intervals have passed since the call
    /// started. Giving up yields an `ExecutionTimeout` failure that is not
    /// memoized and leaves the state untouched, so a later read can still
    /// find the document.
    pub async fn status(&self, throw_on_error: bool) -> Result<CallStatus> {
        let status = match self.settled_status().await {
            Ok(status) => {
                self.advance(settled_state(&status));
                status
            }
            Err(Unsettled::Expired(error)) => self.synthetic_status(error),
            Err(Unsettled::Failed(e)) => return Err(e),
        };

        if throw_on_error && let Some(failure) = status.failure() {
            return Err(Error::call(self.key(), failure));
        }
        Ok(status)
    }

    /// Result of the call.
    ///
    /// Waits for the status document first, then fetches the output document
    /// with a bounded number of attempts. Memoized like [`status`](Self::status).
    pub async fn result(&self, throw_on_error: bool) -> Result<CallResult> {
        let result = match self
            .inner
            .result
            .get_or_try_init(|| self.retrieve_result())
            .await
        {
            Ok(result) => {
                self.advance(match result {
                    CallResult::Value(_) => CallState::Success,
                    CallResult::Futures(_) => CallState::Futures,
                    CallResult::Error(_) => CallState::Error,
                });
                result.clone()
            }
            Err(Unsettled::Expired(error)) => CallResult::Error(error),
            Err(Unsettled::Failed(e)) => return Err(e),
        };

        if throw_on_error && let CallResult::Error(e) = &result {
            return Err(Error::call(self.key(), e.clone()));
        }
        Ok(result)
    }

    async fn settled_status(&self) -> std::result::Result<CallStatus, Unsettled> {
        self.inner
            .status
            .get_or_try_init(|| self.retrieve_status())
            .await
            .cloned()
    }

    async fn retrieve_status(&self) -> std::result::Result<CallStatus, Unsettled> {
        self.lock().stats.status_retrievals += 1;
        let key = storage::status_key(self.key());
        let mut state_rx = self.watch_state();
        let retrieval = self.inner.retrieval;
        let begun = Instant::now();

        loop {
            if let Some(status) = self.lock().delivered.clone() {
                return Ok(status);
            }

            self.lock().stats.status_polls += 1;
            if let Some(body) = self.inner.storage.get(&key).await? {
                let status = match CallStatus::decode(&body) {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(call = %self.key(), error = %e, "Status document is malformed");
                        self.synthetic_status(e)
                    }
                };
                self.record_status(&status);
                return Ok(status);
            }

            // The clock may start (or restart) while we wait
            let clock = self.lock().clock.unwrap_or(begun);
            let deadline = clock + retrieval.status_budget();
            if Instant::now() >= deadline {
                break;
            }
            let pause = retrieval
                .status_interval
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = state_rx.changed() => {}
            }
        }

        if let Some(status) = self.lock().delivered.clone() {
            return Ok(status);
        }
        debug!(call = %self.key(), state = %self.state(), "Stopped waiting for status");
        Err(Unsettled::Expired(CallError::ExecutionTimeout {
            timeout_secs: retrieval.execution_timeout.as_secs(),
        }))
    }

    async fn retrieve_result(&self) -> std::result::Result<CallResult, Unsettled> {
        let status = self.settled_status().await?;
        self.advance(settled_state(&status));
        if let Some(failure) = status.failure() {
            return Ok(CallResult::Error(failure));
        }

        self.lock().stats.output_retrievals += 1;
        let key = storage::output_key(self.key());
        let retrieval = self.inner.retrieval;

        for attempt in 0..retrieval.result_attempts {
            self.lock().stats.output_polls += 1;
            if let Some(body) = self.inner.storage.get(&key).await? {
                self.lock().stats.output_size = Some(body.len() as u64);
                return Ok(match CallOutput::decode(&body) {
                    Ok(CallOutput::Value { value }) => CallResult::Value(value),
                    Ok(CallOutput::Futures { futures }) => {
                        CallResult::Futures(self.adopt_children(futures))
                    }
                    Err(e) => CallResult::Error(e),
                });
            }
            if attempt + 1 < retrieval.result_attempts {
                tokio::time::sleep(retrieval.result_interval).await;
            }
        }

        warn!(call = %self.key(), attempts = retrieval.result_attempts, "Output never appeared");
        Ok(CallResult::Error(CallError::ResultUnavailable {
            attempts: retrieval.result_attempts,
        }))
    }

    /// Child futures for `keys`, reusing any already attached by the monitor.
    fn adopt_children(&self, keys: Vec<CallKey>) -> Vec<CallFuture> {
        let mut shared = self.lock();
        let children: Vec<CallFuture> = keys
            .into_iter()
            .map(|key| {
                shared
                    .children
                    .iter()
                    .find(|c| *c.key() == key)
                    .cloned()
                    .unwrap_or_else(|| self.child(key))
            })
            .collect();
        shared.children = children.clone();
        children
    }

    fn synthetic_status(&self, error: CallError) -> CallStatus {
        let now = Utc::now();
        let shared = self.lock();
        CallStatus {
            executor_id: self.inner.key.executor_id.clone(),
            job_id: self.inner.key.job_id.clone(),
            call_id: self.inner.key.call_id.clone(),
            activation_id: shared.activation_id.clone(),
            exception: true,
            error: Some(error),
            start_time: shared.stats.started_at.unwrap_or(now),
            end_time: now,
            input_size: 0,
            output_size: 0,
            new_futures: Vec::new(),
        }
    }

    fn record_status(&self, status: &CallStatus) {
        let mut shared = self.lock();
        shared.stats.worker_duration_ms = Some(status.duration_ms());
        if shared.activation_id.is_none() {
            shared.activation_id = status.activation_id.clone();
        }
    }

    fn advance(&self, next: CallState) -> bool {
        let changed = self.inner.state.send_if_modified(|state| {
            if next.rank() > state.rank() {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(call = %self.key(), state = %next, "Call state changed");
        }
        changed
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // Shared holds plain data updated in single assignments
        self.inner.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The backend accepted the call.
    pub(crate) fn mark_invoked(&self, activation_id: &str) {
        {
            let mut shared = self.lock();
            shared.activation_id = Some(activation_id.to_string());
            shared.stats.invoked_at = Some(Utc::now());
            shared.clock.get_or_insert_with(Instant::now);
        }
        self.advance(CallState::Invoked);
    }

    /// The monitor saw the call start.
    pub(crate) fn mark_running(&self) {
        {
            let mut shared = self.lock();
            if shared.stats.started_at.is_none() {
                shared.stats.started_at = Some(Utc::now());
                shared.clock = Some(Instant::now());
            }
        }
        self.advance(CallState::Running);
    }

    /// The monitor saw the call end, optionally with its status document.
    pub(crate) fn mark_ready(&self, status: Option<CallStatus>) {
        let failed = {
            let mut shared = self.lock();
            shared.stats.finished_at.get_or_insert_with(Utc::now);
            let failed = status.as_ref().is_some_and(|s| s.exception);
            if let Some(status) = status {
                shared.stats.worker_duration_ms = Some(status.duration_ms());
                if shared.activation_id.is_none() {
                    shared.activation_id = status.activation_id.clone();
                }
                shared.delivered.get_or_insert(status);
            }
            failed
        };
        self.advance(if failed {
            CallState::Error
        } else {
            CallState::Ready
        });
    }

    /// The call failed without a worker-written status (dispatch abort, timeout).
    pub(crate) fn mark_failed(&self, error: CallError) -> CallStatus {
        let status = self.synthetic_status(error);
        {
            let mut shared = self.lock();
            shared.stats.finished_at.get_or_insert_with(Utc::now);
            shared.delivered.get_or_insert(status.clone());
        }
        self.advance(CallState::Error);
        status
    }

    /// Attach futures for calls this call spawned; returns the new ones.
    pub(crate) fn attach_children(&self, keys: &[CallKey]) -> Vec<CallFuture> {
        let mut shared = self.lock();
        let mut added = Vec::new();
        for key in keys {
            if !shared.children.iter().any(|c| c.key() == key) {
                let child = self.child(key.clone());
                shared.children.push(child.clone());
                added.push(child);
            }
        }
        added
    }
}

fn settled_state(status: &CallStatus) -> CallState {
    if status.failure().is_some() {
        CallState::Error
    } else if status.has_new_futures() {
        CallState::Futures
    } else {
        CallState::Ready
    }
}
