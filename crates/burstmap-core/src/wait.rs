// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blocking and bounded collection of call futures.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::future::{self, FutureExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::future::{CallFuture, CallState};
use crate::job::JobKey;

/// When [`WaitCoordinator::wait`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Once every future is done, or the timeout elapsed.
    #[default]
    AllCompleted,
    /// Once at least one future is done.
    AnyCompleted,
    /// Immediately, with whatever is done right now.
    Always,
}

/// Done/total counters published while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitProgress {
    /// Futures done so far.
    pub done: usize,
    /// Futures waited on, nested calls included.
    pub total: usize,
}

/// Options of one wait.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Completion policy.
    pub policy: WaitPolicy,
    /// Hard deadline for the wait itself. Does not affect running calls.
    pub timeout: Option<Duration>,
    /// Raise the first failed call found among the done futures.
    pub throw_except: bool,
    /// Fail with [`Error::WaitTimeout`] instead of returning partial sets.
    pub fail_on_timeout: bool,
    /// Interrupts the wait and stops the pending jobs when cancelled.
    pub cancel: Option<CancellationToken>,
    /// Receives a [`WaitProgress`] each time the done set grows.
    pub progress: Option<watch::Sender<WaitProgress>>,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            policy: WaitPolicy::AllCompleted,
            timeout: None,
            throw_except: true,
            fail_on_timeout: false,
            cancel: None,
            progress: None,
        }
    }
}

impl WaitOptions {
    /// Wait for every future.
    pub fn all() -> Self {
        Self::default()
    }

    /// Wait for the first future.
    pub fn any() -> Self {
        Self {
            policy: WaitPolicy::AnyCompleted,
            ..Self::default()
        }
    }

    /// Do not block.
    pub fn always() -> Self {
        Self {
            policy: WaitPolicy::Always,
            ..Self::default()
        }
    }

    /// Bound the wait by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Raise failed calls (`true`, the default) or return them as done.
    pub fn with_throw_except(mut self, throw_except: bool) -> Self {
        self.throw_except = throw_except;
        self
    }

    /// Treat an elapsed timeout as an error.
    pub fn fail_on_timeout(mut self) -> Self {
        self.fail_on_timeout = true;
        self
    }

    /// Interrupt the wait when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Publish progress on `sender`.
    pub fn with_progress(mut self, sender: watch::Sender<WaitProgress>) -> Self {
        self.progress = Some(sender);
        self
    }
}

/// Futures split by completion.
#[derive(Debug, Clone, Default)]
pub struct WaitOutcome {
    /// Futures that finished, in the order they were given (children last).
    pub done: Vec<CallFuture>,
    /// Futures still running.
    pub pending: Vec<CallFuture>,
}

impl WaitOutcome {
    /// Whether nothing is pending.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Waits on futures according to a [`WaitPolicy`].
///
/// With a dispatcher attached, an interrupted wait also stops dispatching and
/// observing the jobs of the pending futures.
#[derive(Clone, Default)]
pub struct WaitCoordinator {
    dispatcher: Option<Dispatcher>,
}

impl WaitCoordinator {
    /// Create a coordinator; `dispatcher` is used to tear down interrupted jobs.
    pub fn new(dispatcher: Option<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Wait on `futures`.
    ///
    /// Calls spawned by done futures join the waited set. Returns the done
    /// and pending sets once the policy is satisfied or the timeout elapsed.
    pub async fn wait(&self, futures: &[CallFuture], options: WaitOptions) -> Result<WaitOutcome> {
        let mut set = futures.to_vec();
        let deadline = options.timeout.map(|t| Instant::now() + t);
        let mut reported = None;

        debug!(
            futures = set.len(),
            policy = ?options.policy,
            timeout_ms = options.timeout.map(|t| t.as_millis() as u64),
            "Waiting on futures"
        );

        loop {
            expand_children(&mut set);
            let outcome = partition(&set);
            report_progress(&options, &outcome, &mut reported);

            let satisfied = match options.policy {
                WaitPolicy::Always => true,
                WaitPolicy::AnyCompleted => !outcome.done.is_empty() || outcome.pending.is_empty(),
                WaitPolicy::AllCompleted => outcome.pending.is_empty(),
            };
            if satisfied {
                return finish(outcome, &options).await;
            }

            let changes = outcome.pending.iter().map(|f| {
                let mut rx = f.watch_state();
                async move { rx.wait_for(|s| s.is_done()).await.map(|_| ()) }.boxed()
            });

            tokio::select! {
                biased;
                _ = cancelled(options.cancel.as_ref()) => {
                    let not_done = outcome.pending.len();
                    self.stop_pending(&outcome.pending);
                    info!(not_done, "Wait interrupted");
                    return Err(Error::Interrupted { not_done });
                }
                _ = expired(deadline) => {
                    expand_children(&mut set);
                    let outcome = partition(&set);
                    report_progress(&options, &outcome, &mut reported);
                    if outcome.pending.is_empty() {
                        return finish(outcome, &options).await;
                    }
                    let not_done = outcome.pending.len();
                    info!(not_done, total = set.len(), "Wait timed out");
                    if options.fail_on_timeout {
                        return Err(Error::WaitTimeout { not_done, total: set.len() });
                    }
                    return finish(outcome, &options).await;
                }
                _ = future::select_all(changes) => {}
            }
        }
    }

    fn stop_pending(&self, pending: &[CallFuture]) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };
        let jobs: BTreeSet<JobKey> = pending.iter().map(|f| f.job_key()).collect();
        for job in &jobs {
            dispatcher.stop_job(job);
        }
    }
}

async fn finish(outcome: WaitOutcome, options: &WaitOptions) -> Result<WaitOutcome> {
    if options.throw_except {
        for future in outcome.done.iter().filter(|f| f.state() == CallState::Error) {
            future.status(true).await?;
        }
    }
    debug!(
        done = outcome.done.len(),
        pending = outcome.pending.len(),
        "Wait returned"
    );
    Ok(outcome)
}

fn expand_children(set: &mut Vec<CallFuture>) {
    let mut i = 0;
    while i < set.len() {
        if set[i].is_done() {
            for child in set[i].children() {
                if !set.iter().any(|f| f.key() == child.key()) {
                    set.push(child);
                }
            }
        }
        i += 1;
    }
}

fn partition(set: &[CallFuture]) -> WaitOutcome {
    let (done, pending): (Vec<_>, Vec<_>) = set.iter().cloned().partition(|f| f.is_done());
    WaitOutcome { done, pending }
}

fn report_progress(options: &WaitOptions, outcome: &WaitOutcome, reported: &mut Option<usize>) {
    let Some(progress) = &options.progress else {
        return;
    };
    let done = outcome.done.len();
    if *reported != Some(done) {
        *reported = Some(done);
        progress.send_replace(WaitProgress {
            done,
            total: done + outcome.pending.len(),
        });
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => future::pending().await,
    }
}

async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
