// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Credit-based admission control.
//!
//! One [`AdmissionToken`] is the right to have one outstanding invocation.
//! The controller is a counting semaphore sized to the backend's maximum
//! concurrency, so `outstanding <= capacity` holds at all times. Shutting the
//! controller down wakes every blocked [`acquire`](AdmissionController::acquire)
//! with [`Admission::Shutdown`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Default)]
struct Counters {
    outstanding: AtomicUsize,
    peak: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

/// Right to one outstanding invocation. Returned to the controller on drop.
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for AdmissionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionToken").finish_non_exhaustive()
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        self.counters.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Outcome of [`AdmissionController::acquire`].
#[derive(Debug)]
pub enum Admission {
    /// A token was granted.
    Token(AdmissionToken),
    /// The controller was shut down; the caller must stop.
    Shutdown,
}

/// Counting semaphore over backend concurrency.
#[derive(Clone)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl AdmissionController {
    /// Create a controller granting at most `capacity` tokens at once.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wait for a token.
    pub async fn acquire(&self) -> Admission {
        match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => Admission::Token(self.issue(permit)),
            Err(_) => Admission::Shutdown,
        }
    }

    /// Take a token if one is free right now.
    pub fn try_acquire(&self) -> Option<AdmissionToken> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.issue(permit))
    }

    /// Return a token. Equivalent to dropping it.
    pub fn release(&self, token: AdmissionToken) {
        drop(token);
    }

    /// Maximum number of outstanding tokens.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tokens that could be granted right now.
    pub fn available(&self) -> usize {
        if self.semaphore.is_closed() {
            0
        } else {
            self.semaphore.available_permits()
        }
    }

    /// Tokens currently held.
    pub fn outstanding(&self) -> usize {
        self.counters.outstanding.load(Ordering::SeqCst)
    }

    /// Highest number of tokens held at once.
    pub fn peak_outstanding(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    /// Tokens granted since creation.
    pub fn acquired_total(&self) -> u64 {
        self.counters.acquired.load(Ordering::SeqCst)
    }

    /// Tokens returned since creation.
    pub fn released_total(&self) -> u64 {
        self.counters.released.load(Ordering::SeqCst)
    }

    /// Stop granting tokens and wake every waiter with [`Admission::Shutdown`].
    pub fn shutdown(&self) {
        if !self.semaphore.is_closed() {
            debug!(outstanding = self.outstanding(), "Admission controller shut down");
            self.semaphore.close();
        }
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shutdown(&self) -> bool {
        self.semaphore.is_closed()
    }

    fn issue(&self, permit: OwnedSemaphorePermit) -> AdmissionToken {
        let outstanding = self.counters.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(outstanding, Ordering::SeqCst);
        self.counters.acquired.fetch_add(1, Ordering::SeqCst);
        AdmissionToken {
            _permit: permit,
            counters: self.counters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_capacity_bounds_outstanding() {
        let admission = AdmissionController::new(2);
        let a = admission.try_acquire().unwrap();
        let _b = admission.try_acquire().unwrap();

        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.outstanding(), 2);
        assert_eq!(admission.available(), 0);

        admission.release(a);
        assert_eq!(admission.outstanding(), 1);
        assert!(admission.try_acquire().is_some());
        assert_eq!(admission.peak_outstanding(), 2);
        assert_eq!(admission.acquired_total(), 3);
        assert_eq!(admission.released_total(), 2);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_release() {
        let admission = AdmissionController::new(1);
        let held = admission.try_acquire().unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { matches!(admission.acquire().await, Admission::Token(_)) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let admission = AdmissionController::new(1);
        let _held = admission.try_acquire().unwrap();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { matches!(admission.acquire().await, Admission::Shutdown) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        admission.shutdown();
        assert!(waiter.await.unwrap());
        assert!(admission.is_shutdown());
        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.available(), 0);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        assert_eq!(AdmissionController::new(0).capacity(), 1);
    }
}
