// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ledger of in-flight invocations.
//!
//! The dispatcher registers each chunk together with the admission token it
//! was invoked under *before* contacting the backend. The completion monitor
//! reports every finished call; once all calls of a chunk have finished, the
//! chunk's token goes back to the admission controller. A rejected or failed
//! invocation is revoked and its token returned immediately.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use crate::admission::AdmissionToken;
use crate::job::CallKey;

/// Identifier of a registered invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvocationId(u64);

struct Entry {
    remaining: usize,
    _token: AdmissionToken,
}

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    by_call: HashMap<CallKey, InvocationId>,
    entries: HashMap<InvocationId, Entry>,
}

/// Maps outstanding calls to the admission token of their invocation.
#[derive(Default)]
pub struct InvocationLedger {
    state: Mutex<LedgerState>,
}

impl InvocationLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an invocation covering `calls`, held under `token`.
    pub fn register(&self, calls: &[CallKey], token: AdmissionToken) -> InvocationId {
        let mut state = self.lock();
        let id = InvocationId(state.next_id);
        state.next_id += 1;
        for call in calls {
            state.by_call.insert(call.clone(), id);
        }
        state.entries.insert(
            id,
            Entry {
                remaining: calls.len(),
                _token: token,
            },
        );
        id
    }

    /// Drop an invocation that the backend did not accept, returning its token.
    pub fn revoke(&self, id: InvocationId) {
        let mut state = self.lock();
        state.by_call.retain(|_, v| *v != id);
        state.entries.remove(&id);
    }

    /// Record that `call` ended. Returns true when this released a token.
    ///
    /// Unknown calls (nested calls, already finished calls) are ignored.
    pub fn call_finished(&self, call: &CallKey) -> bool {
        let mut state = self.lock();
        let Some(id) = state.by_call.remove(call) else {
            return false;
        };
        let done = match state.entries.get_mut(&id) {
            Some(entry) => {
                entry.remaining = entry.remaining.saturating_sub(1);
                entry.remaining == 0
            }
            None => false,
        };
        if done {
            state.entries.remove(&id);
            trace!(call = %call, "Invocation finished, admission token released");
        }
        done
    }

    /// Whether `call` belongs to an invocation still holding a token.
    pub fn holds(&self, call: &CallKey) -> bool {
        self.lock().by_call.contains_key(call)
    }

    /// Invocations currently holding a token.
    pub fn outstanding(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;

    fn keys(job: &str, n: usize) -> Vec<CallKey> {
        (0..n)
            .map(|i| CallKey::new("ex", job, crate::job::format_call_id(i)))
            .collect()
    }

    #[test]
    fn test_token_released_after_whole_chunk() {
        let admission = AdmissionController::new(1);
        let ledger = InvocationLedger::new();
        let calls = keys("M000", 3);

        ledger.register(&calls, admission.try_acquire().unwrap());
        assert_eq!(admission.available(), 0);

        assert!(!ledger.call_finished(&calls[0]));
        assert!(!ledger.call_finished(&calls[0]));
        assert!(!ledger.call_finished(&calls[2]));
        assert_eq!(admission.available(), 0);

        assert!(ledger.call_finished(&calls[1]));
        assert_eq!(admission.available(), 1);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[test]
    fn test_revoke_returns_token() {
        let admission = AdmissionController::new(1);
        let ledger = InvocationLedger::new();
        let calls = keys("M000", 2);

        let id = ledger.register(&calls, admission.try_acquire().unwrap());
        ledger.revoke(id);

        assert_eq!(admission.available(), 1);
        assert!(!ledger.call_finished(&calls[0]));
    }

    #[test]
    fn test_holds_tracks_unfinished_calls() {
        let admission = AdmissionController::new(2);
        let ledger = InvocationLedger::new();
        let a = keys("M000", 2);
        let b = keys("M001", 1);

        ledger.register(&a, admission.try_acquire().unwrap());
        assert!(ledger.holds(&a[0]));
        assert!(!ledger.holds(&b[0]));

        ledger.call_finished(&a[0]);
        assert!(!ledger.holds(&a[0]));
        assert!(ledger.holds(&a[1]));
        assert_eq!(ledger.outstanding(), 1);
    }
}
