// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion monitor.
//!
//! One background watch task per job observes `init` and `end` events for the
//! job's calls, either by polling the job namespace in storage or by consuming
//! the job's push topic. Every `end` is applied to the call's future and to
//! the invocation ledger (which releases admission tokens). Calls running past
//! their execution timeout get a synthesized timeout `end`.
//!
//! Push watches also rescan storage every [`PUSH_RESCAN_TICKS`] poll intervals
//! and before timing a call out, so an event lost by the bus only delays its
//! `end`.
//!
//! A watch ends once every expected `end` arrived or when the monitor shuts
//! down. Stopping a job detaches its watch, which then keeps polling until no
//! call it covers holds an admission token.

mod polling;
mod push;
mod tracker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, MonitorStrategy};
use crate::error::{Error, Result};
use crate::future::CallFuture;
use crate::job::JobKey;
use crate::ledger::InvocationLedger;
use crate::pubsub::PubSub;
use crate::status::{CompletionEvent, EventKind};
use crate::storage::Storage;

use push::Subscriptions;
use tracker::JobTracker;

/// Stream of deduplicated completion events of one watch.
pub type EventStream = BoxStream<'static, CompletionEvent>;

/// Poll intervals between the storage rescans of a push watch.
pub const PUSH_RESCAN_TICKS: u32 = 10;

struct MonitorInner {
    storage: Arc<dyn Storage>,
    pubsub: Option<Arc<dyn PubSub>>,
    ledger: Arc<InvocationLedger>,
    strategy: MonitorStrategy,
    poll_interval: Duration,
    timeout_grace: Duration,
    watches: Mutex<HashMap<JobKey, (u64, CancellationToken)>>,
    next_watch: AtomicU64,
    shutdown: CancellationToken,
}

impl MonitorInner {
    fn watches(&self) -> std::sync::MutexGuard<'_, HashMap<JobKey, (u64, CancellationToken)>> {
        self.watches.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn scan_pending(&self, tracker: &mut JobTracker) {
        for pending in tracker.pending_jobs() {
            if let Err(e) = polling::scan_namespace(self.storage.as_ref(), tracker, &pending).await
            {
                warn!(job = %pending, error = %e, "Storage scan failed");
            }
        }
    }
}

/// Observes call completion and feeds the admission ledger.
#[derive(Clone)]
pub struct CompletionMonitor {
    inner: Arc<MonitorInner>,
}

impl CompletionMonitor {
    /// Create a monitor.
    ///
    /// The push strategy requires a pub/sub collaborator.
    pub fn new(
        storage: Arc<dyn Storage>,
        pubsub: Option<Arc<dyn PubSub>>,
        ledger: Arc<InvocationLedger>,
        config: &EngineConfig,
    ) -> Result<Self> {
        if config.monitor_strategy == MonitorStrategy::Push && pubsub.is_none() {
            return Err(Error::InvalidRequest(
                "push monitoring requires a pub/sub collaborator".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(MonitorInner {
                storage,
                pubsub,
                ledger,
                strategy: config.monitor_strategy,
                poll_interval: config.monitor_poll_interval,
                timeout_grace: config.timeout_grace,
                watches: Mutex::new(HashMap::new()),
                next_watch: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Strategy in use.
    pub fn strategy(&self) -> MonitorStrategy {
        self.inner.strategy
    }

    /// Start watching `futures` of `job`.
    ///
    /// With the push strategy the job topic is subscribed before this
    /// returns, so no event published afterwards can be missed.
    pub async fn observe(&self, job: &JobKey, futures: Vec<CallFuture>) -> Result<EventStream> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = JobTracker::new(
            job.clone(),
            futures,
            self.inner.ledger.clone(),
            tx,
            self.inner.timeout_grace,
        );

        let source = match (&self.inner.strategy, &self.inner.pubsub) {
            (MonitorStrategy::Push, Some(pubsub)) => {
                let mut subs = Subscriptions::new(pubsub.clone());
                subs.add(job).await?;
                Source::Push(subs)
            }
            _ => Source::Polling,
        };

        let stop = CancellationToken::new();
        let watch_id = self.inner.next_watch.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .inner
            .watches()
            .insert(job.clone(), (watch_id, stop.clone()));
        if let Some((_, previous)) = previous {
            warn!(job = %job, "Job was already being watched, replacing watch");
            previous.cancel();
        }

        tokio::spawn(run_watch(
            self.inner.clone(),
            tracker,
            source,
            watch_id,
            stop,
        ));

        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }

    /// Stop watching `job`. Its futures keep their current state.
    ///
    /// The detached watch keeps settling calls that were handed to the
    /// backend, so their admission tokens return once they end or time out.
    pub fn stop_job(&self, job: &JobKey) {
        let removed = self.inner.watches().remove(job);
        if let Some((_, stop)) = removed {
            debug!(job = %job, "Stopping completion watch");
            stop.cancel();
        }
    }

    /// Whether `job` is being watched.
    pub fn is_watching(&self, job: &JobKey) -> bool {
        self.inner.watches().contains_key(job)
    }

    /// Number of live watches.
    pub fn active_watches(&self) -> usize {
        self.inner.watches().len()
    }

    /// Stop every watch and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.watches().clear();
    }
}

enum Source {
    Polling,
    Push(Subscriptions),
}

async fn run_watch(
    inner: Arc<MonitorInner>,
    mut tracker: JobTracker,
    mut source: Source,
    watch_id: u64,
    stop: CancellationToken,
) {
    let job = tracker.job().clone();
    info!(
        job = %job,
        calls = tracker.total(),
        strategy = inner.strategy.as_str(),
        "Completion watch started"
    );

    // Initial scan: the first poll, or the push catch-up
    if let Err(e) = polling::scan_namespace(inner.storage.as_ref(), &mut tracker, &job).await {
        warn!(job = %job, error = %e, "Initial scan failed");
    }

    let rescan_every = inner.poll_interval.saturating_mul(PUSH_RESCAN_TICKS);
    let mut last_rescan = Instant::now();
    let mut draining = false;

    while !tracker.is_complete() {
        if !draining && stop.is_cancelled() {
            draining = true;
            // Dropping the push source unsubscribes from every topic
            source = Source::Polling;
            info!(job = %job, "Completion watch detached, draining invoked calls");
        }
        if draining && tracker.holds_no_tokens() {
            break;
        }

        let tick = next_tick(&tracker, inner.poll_interval);

        match &mut source {
            Source::Polling => {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    _ = stop.cancelled(), if !draining => continue,
                    _ = tokio::time::sleep_until(tick) => {}
                }
                inner.scan_pending(&mut tracker).await;
            }
            Source::Push(subs) => {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    _ = stop.cancelled() => continue,
                    message = subs.next(), if !subs.is_empty() => {
                        if let Some(message) = message {
                            apply_message(&mut tracker, &message);
                        }
                    }
                    _ = tokio::time::sleep_until(tick) => {}
                }
                let now = Instant::now();
                let timing_out = tracker.next_deadline().is_some_and(|d| d <= now);
                if timing_out || now.duration_since(last_rescan) >= rescan_every {
                    last_rescan = now;
                    inner.scan_pending(&mut tracker).await;
                }
            }
        }

        tracker.sweep();

        let new_jobs = tracker.take_new_jobs();
        for nested in new_jobs {
            if let Source::Push(subs) = &mut source
                && let Err(e) = subs.add(&nested).await
            {
                warn!(job = %nested, error = %e, "Subscribe to nested job failed");
            }
            // Catch up on anything the nested calls reported before we looked
            if let Err(e) =
                polling::scan_namespace(inner.storage.as_ref(), &mut tracker, &nested).await
            {
                warn!(job = %nested, error = %e, "Nested job scan failed");
            }
        }
    }

    drop(source);

    {
        let mut watches = inner.watches();
        if watches.get(&job).is_some_and(|(id, _)| *id == watch_id) {
            watches.remove(&job);
        }
    }

    if tracker.is_complete() {
        info!(job = %job, calls = tracker.total(), "Completion watch finished");
    } else {
        info!(job = %job, "Completion watch stopped");
    }
}

/// Next wake-up: the poll interval, or an earlier execution deadline.
fn next_tick(tracker: &JobTracker, poll_interval: Duration) -> Instant {
    let tick = Instant::now() + poll_interval;
    match tracker.next_deadline() {
        Some(deadline) if deadline < tick => deadline,
        _ => tick,
    }
}

fn apply_message(tracker: &mut JobTracker, message: &[u8]) {
    match CompletionEvent::decode(message) {
        Ok(event) => match event.kind {
            EventKind::Init => tracker.on_init(&event.call),
            EventKind::End => tracker.on_end(&event.call, event.status),
        },
        Err(e) => warn!(job = %tracker.job(), error = %e, "Dropping undecodable event"),
    }
}
