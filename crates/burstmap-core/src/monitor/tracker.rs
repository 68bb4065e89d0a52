// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-watch bookkeeping shared by both strategies.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::future::{CallFuture, CallState};
use crate::job::{CallKey, JobKey};
use crate::ledger::InvocationLedger;
use crate::status::{CallStatus, CompletionEvent, EventKind};

struct Tracked {
    future: CallFuture,
    started: bool,
    ended: bool,
    /// Start of the execution-timeout window: init time, else first time seen invoked.
    clock: Option<Instant>,
}

/// Deduplicates init/end observations of the calls a watch covers and
/// applies them to futures, the ledger and the event stream.
pub(super) struct JobTracker {
    job: JobKey,
    calls: HashMap<CallKey, Tracked>,
    pending: usize,
    grace: Duration,
    ledger: Arc<InvocationLedger>,
    events: mpsc::UnboundedSender<CompletionEvent>,
    jobs: BTreeSet<JobKey>,
    new_jobs: Vec<JobKey>,
}

impl JobTracker {
    pub(super) fn new(
        job: JobKey,
        futures: Vec<CallFuture>,
        ledger: Arc<InvocationLedger>,
        events: mpsc::UnboundedSender<CompletionEvent>,
        grace: Duration,
    ) -> Self {
        let mut tracker = Self {
            job: job.clone(),
            calls: HashMap::new(),
            pending: 0,
            grace,
            ledger,
            events,
            jobs: BTreeSet::from([job]),
            new_jobs: Vec::new(),
        };
        for future in futures {
            tracker.track(future, None);
        }
        tracker
    }

    fn track(&mut self, future: CallFuture, clock: Option<Instant>) {
        let key = future.key().clone();
        if self.calls.contains_key(&key) {
            return;
        }
        let job = future.job_key();
        if self.jobs.insert(job.clone()) {
            self.new_jobs.push(job);
        }
        self.calls.insert(
            key,
            Tracked {
                future,
                started: false,
                ended: false,
                clock,
            },
        );
        self.pending += 1;
    }

    pub(super) fn job(&self) -> &JobKey {
        &self.job
    }

    pub(super) fn total(&self) -> usize {
        self.calls.len()
    }

    pub(super) fn is_complete(&self) -> bool {
        self.pending == 0
    }

    /// Whether no call still awaiting its end holds an admission token.
    pub(super) fn holds_no_tokens(&self) -> bool {
        !self
            .calls
            .iter()
            .any(|(key, t)| !t.ended && self.ledger.holds(key))
    }

    /// Namespaces that still have calls awaiting their end.
    pub(super) fn pending_jobs(&self) -> Vec<JobKey> {
        let set: BTreeSet<JobKey> = self
            .calls
            .values()
            .filter(|t| !t.ended)
            .map(|t| t.future.job_key())
            .collect();
        set.into_iter().collect()
    }

    /// Namespaces added by dynamic fan-out since the last call.
    pub(super) fn take_new_jobs(&mut self) -> Vec<JobKey> {
        std::mem::take(&mut self.new_jobs)
    }

    pub(super) fn awaits_end(&self, call: &CallKey) -> bool {
        self.calls.get(call).is_some_and(|t| !t.ended)
    }

    pub(super) fn on_init(&mut self, call: &CallKey) {
        let Some(tracked) = self.calls.get_mut(call) else {
            return;
        };
        if tracked.started || tracked.ended {
            return;
        }
        tracked.started = true;
        tracked.clock = Some(Instant::now());
        tracked.future.mark_running();
        let activation_id = tracked.future.activation_id();
        self.emit(CompletionEvent::init(call.clone(), activation_id));
    }

    pub(super) fn on_end(&mut self, call: &CallKey, status: Option<CallStatus>) {
        let Some(tracked) = self.calls.get_mut(call) else {
            return;
        };
        if tracked.ended {
            return;
        }
        tracked.ended = true;
        tracked.started = true;
        let future = tracked.future.clone();
        self.pending -= 1;

        // Children are registered before the parent turns done, so a waiter
        // that wakes on the parent already sees them
        if let Some(st) = status.as_ref().filter(|s| s.has_new_futures()) {
            let now = Instant::now();
            let children = future.attach_children(&st.new_futures);
            debug!(call = %call, children = children.len(), "Call spawned nested calls");
            for child in children {
                self.track(child, Some(now));
            }
        }

        future.mark_running();
        future.mark_ready(status.clone());
        self.ledger.call_finished(call);

        let event = match status {
            Some(status) => CompletionEvent::end(status),
            None => CompletionEvent {
                kind: EventKind::End,
                call: call.clone(),
                timestamp: Utc::now(),
                activation_id: future.activation_id(),
                status: None,
            },
        };
        self.emit(event);
    }

    /// Settle calls that timed out or were failed outside the monitor.
    pub(super) fn sweep(&mut self) {
        let now = Instant::now();
        let mut settled: Vec<CallKey> = Vec::new();
        let mut timed_out: Vec<(CallKey, CallStatus)> = Vec::new();

        for (key, tracked) in self.calls.iter_mut().filter(|(_, t)| !t.ended) {
            let state = tracked.future.state();
            if state == CallState::Error {
                // Failed by the dispatcher (abort) or by a delivered status
                tracked.ended = true;
                settled.push(key.clone());
                continue;
            }
            if tracked.clock.is_none() && state != CallState::New {
                tracked.clock = Some(now);
            }
            let Some(clock) = tracked.clock else {
                continue;
            };
            let budget = tracked.future.execution_timeout() + self.grace;
            if now.duration_since(clock) >= budget {
                tracked.ended = true;
                let timeout_secs = tracked.future.execution_timeout().as_secs();
                warn!(call = %key, timeout_secs, "Call exceeded its execution timeout");
                let status = tracked
                    .future
                    .mark_failed(CallError::ExecutionTimeout { timeout_secs });
                timed_out.push((key.clone(), status));
            }
        }

        for key in settled {
            self.pending -= 1;
            self.ledger.call_finished(&key);
        }
        for (key, status) in timed_out {
            self.pending -= 1;
            self.ledger.call_finished(&key);
            self.emit(CompletionEvent::end(status));
        }
    }

    /// Earliest instant at which `sweep` could time a call out.
    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.calls
            .values()
            .filter(|t| !t.ended)
            .filter_map(|t| t.clock.map(|c| c + t.future.execution_timeout() + self.grace))
            .min()
    }

    fn emit(&self, event: CompletionEvent) {
        // The consumer may have dropped the stream
        let _ = self.events.send(event);
    }
}
