// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded re-submission of failed calls.
//!
//! A [`RetryableUnit`] pairs one input with the future of its latest attempt.
//! [`RetryCoordinator::wait`] watches the units and, whenever an attempt
//! fails and the unit still has retries left, dispatches the input again as a
//! fresh single-call job. Units out of retries finish with
//! [`CallError::RetryBoundExceeded`] wrapping the last failure.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::{CallError, Error, Result};
use crate::executor::{FunctionExecutor, MapOptions};
use crate::future::{CallFuture, CallResult, CallState};
use crate::job::CallInput;
use crate::wait::{WaitOptions, WaitPolicy};

struct UnitState {
    future: CallFuture,
    failures: u32,
    attempts: u32,
    cancelled: bool,
    exhausted: Option<CallError>,
}

struct UnitInner {
    index: usize,
    function: Vec<u8>,
    input: CallInput,
    options: MapOptions,
    state: Mutex<UnitState>,
}

/// One input under retry, with the future of its latest attempt.
#[derive(Clone)]
pub struct RetryableUnit {
    inner: Arc<UnitInner>,
}

impl std::fmt::Debug for RetryableUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RetryableUnit")
            .field("index", &self.inner.index)
            .field("call", &state.future.key())
            .field("failures", &state.failures)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}

impl RetryableUnit {
    fn new(
        index: usize,
        function: Vec<u8>,
        input: CallInput,
        options: MapOptions,
        future: CallFuture,
    ) -> Self {
        Self {
            inner: Arc::new(UnitInner {
                index,
                function,
                input,
                options,
                state: Mutex::new(UnitState {
                    future,
                    failures: 0,
                    attempts: 1,
                    cancelled: false,
                    exhausted: None,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UnitState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Position of the input in the original batch.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// The input being retried.
    pub fn input(&self) -> &CallInput {
        &self.inner.input
    }

    /// Future of the latest attempt.
    pub fn future(&self) -> CallFuture {
        self.lock().future.clone()
    }

    /// Failed attempts that were retried.
    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Attempts dispatched so far.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// Stop retrying this unit. The running attempt is left alone.
    pub fn cancel(&self) {
        self.lock().cancelled = true;
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Whether the unit ran out of retries.
    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted.is_some()
    }

    /// Result of the unit: the latest attempt's result, or
    /// [`CallError::RetryBoundExceeded`] once out of retries.
    pub async fn result(&self, throw_on_error: bool) -> Result<CallResult> {
        let (future, exhausted) = {
            let state = self.lock();
            (state.future.clone(), state.exhausted.clone())
        };
        if let Some(e) = exhausted {
            if throw_on_error {
                return Err(Error::call(future.key(), e));
            }
            return Ok(CallResult::Error(e));
        }
        future.result(throw_on_error).await
    }

    /// Settled: succeeded, exhausted, or failed after cancellation.
    fn is_settled(&self) -> bool {
        let state = self.lock();
        if state.exhausted.is_some() {
            return true;
        }
        let call_state = state.future.state();
        call_state.is_done() && (call_state != CallState::Error || state.cancelled)
    }
}

/// Units split by completion.
#[derive(Debug, Clone, Default)]
pub struct RetryOutcome {
    /// Units that succeeded or ran out of retries.
    pub done: Vec<RetryableUnit>,
    /// Units still running an attempt.
    pub pending: Vec<RetryableUnit>,
}

/// Re-dispatches failed calls up to a retry bound.
#[derive(Clone)]
pub struct RetryCoordinator {
    executor: FunctionExecutor,
    retries: u32,
}

impl RetryCoordinator {
    /// Coordinator allowing `retries` re-submissions per input.
    pub fn new(executor: FunctionExecutor, retries: u32) -> Self {
        Self { executor, retries }
    }

    /// Retry bound.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Map `function` over `inputs`, wrapping every call in a unit.
    pub async fn map(
        &self,
        function: impl Into<Vec<u8>>,
        inputs: Vec<CallInput>,
        options: &MapOptions,
    ) -> Result<Vec<RetryableUnit>> {
        let function = function.into();
        let futures = self
            .executor
            .map(function.clone(), inputs.clone(), options)
            .await?;

        Ok(inputs
            .into_iter()
            .zip(futures)
            .enumerate()
            .map(|(index, (input, future))| {
                RetryableUnit::new(index, function.clone(), input, options.clone(), future)
            })
            .collect())
    }

    /// Wait on `units` under `options.policy`, retrying failures as they
    /// appear.
    ///
    /// The policy is evaluated against settled units: a unit counts as done
    /// once it succeeded or ran out of retries. With `throw_except`, an
    /// exhausted unit raises its [`CallError::RetryBoundExceeded`].
    pub async fn wait(&self, units: &[RetryableUnit], options: WaitOptions) -> Result<RetryOutcome> {
        let deadline = options.timeout.map(|t| Instant::now() + t);

        loop {
            for unit in units {
                self.settle(unit).await?;
            }

            let (done, pending): (Vec<_>, Vec<_>) =
                units.iter().cloned().partition(|u| u.is_settled());

            let satisfied = match options.policy {
                WaitPolicy::Always => true,
                WaitPolicy::AnyCompleted => !done.is_empty() || pending.is_empty(),
                WaitPolicy::AllCompleted => pending.is_empty(),
            };
            let expired = deadline.is_some_and(|d| Instant::now() >= d);

            if satisfied || expired {
                if !satisfied && options.fail_on_timeout {
                    return Err(Error::WaitTimeout {
                        not_done: pending.len(),
                        total: units.len(),
                    });
                }
                if options.throw_except {
                    for unit in &done {
                        unit.result(true).await?;
                    }
                }
                return Ok(RetryOutcome { done, pending });
            }

            let futures: Vec<CallFuture> = pending.iter().map(|u| u.future()).collect();
            let mut inner = WaitOptions::any().with_throw_except(false);
            inner.cancel = options.cancel.clone();
            if let Some(deadline) = deadline {
                inner = inner.with_timeout(deadline.saturating_duration_since(Instant::now()));
            }
            self.executor.wait(&futures, inner).await?;
        }
    }

    /// Retry or exhaust `unit` if its latest attempt failed.
    async fn settle(&self, unit: &RetryableUnit) -> Result<()> {
        let (future, failures, cancelled) = {
            let state = unit.lock();
            if state.exhausted.is_some() {
                return Ok(());
            }
            (state.future.clone(), state.failures, state.cancelled)
        };
        if future.state() != CallState::Error || cancelled {
            return Ok(());
        }

        let last = future
            .status(false)
            .await?
            .failure()
            .unwrap_or_else(|| CallError::execution("UnknownError", "call failed"));

        if failures >= self.retries {
            let attempts = failures + 1;
            error!(
                call = %future.key(),
                input = unit.index(),
                attempts,
                error = %last,
                "Retry bound exceeded"
            );
            unit.lock().exhausted = Some(CallError::RetryBoundExceeded {
                attempts,
                last: Box::new(last),
            });
            return Ok(());
        }

        warn!(
            call = %future.key(),
            input = unit.index(),
            failure = failures + 1,
            retries = self.retries,
            error = %last,
            "Call failed, retrying"
        );
        let retry = self
            .executor
            .map(
                unit.inner.function.clone(),
                vec![unit.inner.input.clone()],
                &unit.inner.options,
            )
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidRequest("retry job produced no future".into()))?;

        debug!(input = unit.index(), call = %retry.key(), "Retry dispatched");
        let mut state = unit.lock();
        state.failures += 1;
        state.attempts += 1;
        state.future = retry;
        Ok(())
    }
}
