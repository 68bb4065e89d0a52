// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for burstmap-core integration tests.
//!
//! Provides TestContext wiring a mock backend, storage and executor together.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use burstmap_core::{
    CallInput, EngineConfig, FunctionExecutor, LocalPubSub, MemoryStorage, MockBackend,
    MockOutcome, PubSub, Storage,
};

/// Test context holding the executor and its collaborators.
pub struct TestContext {
    pub storage: Arc<dyn Storage>,
    pub backend: Arc<MockBackend>,
    pub executor: FunctionExecutor,
}

/// Engine configuration with short intervals suited to tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_monitor_poll_interval(Duration::from_millis(5))
        .with_status_polling(Duration::from_millis(5), 4000)
        .with_result_polling(Duration::from_millis(5), 40)
        .with_rejection_backoff(Duration::from_millis(1), Duration::from_millis(10))
}

impl TestContext {
    /// Context over in-memory storage with a mock backend shaped by `configure`.
    pub async fn new(configure: impl FnOnce(MockBackend) -> MockBackend) -> Self {
        Self::with_config(fast_config(), configure).await
    }

    /// Like [`TestContext::new`] with an explicit engine configuration.
    pub async fn with_config(
        config: EngineConfig,
        configure: impl FnOnce(MockBackend) -> MockBackend,
    ) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        Self::build(config, storage, None, configure).await
    }

    /// Context using push monitoring over a local pub/sub bus.
    pub async fn push(configure: impl FnOnce(MockBackend) -> MockBackend) -> Self {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let pubsub: Arc<dyn PubSub> = Arc::new(LocalPubSub::default());
        let config =
            fast_config().with_monitor_strategy(burstmap_core::MonitorStrategy::Push);
        Self::build(config, storage, Some(pubsub), configure).await
    }

    /// Context over an explicit storage backend.
    pub async fn build(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        pubsub: Option<Arc<dyn PubSub>>,
        configure: impl FnOnce(MockBackend) -> MockBackend,
    ) -> Self {
        let mut backend = MockBackend::new(storage.clone());
        if let Some(pubsub) = &pubsub {
            backend = backend.with_pubsub(pubsub.clone());
        }
        let backend = Arc::new(configure(backend));

        let mut builder = FunctionExecutor::builder()
            .config(config)
            .storage(storage.clone())
            .backend(backend.clone())
            .executor_id("test");
        if let Some(pubsub) = pubsub {
            builder = builder.pubsub(pubsub);
        }
        let executor = builder.build().await.expect("Failed to build executor");

        Self {
            storage,
            backend,
            executor,
        }
    }

    /// Wait until every admission token is back, or panic after 5s.
    pub async fn wait_for_released_tokens(&self) {
        let admission = self.executor.admission();
        tokio::time::timeout(Duration::from_secs(5), async {
            while admission.outstanding() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("admission tokens were not released");
    }
}

impl Drop for TestContext {
    fn drop(&mut self) {
        self.backend.shutdown();
        self.executor.shutdown();
    }
}

/// JSON inputs `0..n`.
pub fn numbers(n: i64) -> Vec<CallInput> {
    (0..n).map(|i| CallInput::json(&json!(i))).collect()
}

/// Handler failing the first `fail_times` attempts of every input whose
/// number is in `failing` (all inputs when `failing` is empty).
pub fn flaky(
    fail_times: u32,
    failing: &[i64],
) -> impl Fn(&burstmap_core::MockCall) -> MockOutcome + Send + Sync + 'static {
    let failing = failing.to_vec();
    let attempts: Arc<Mutex<HashMap<i64, u32>>> = Arc::default();
    move |call| {
        let n = call.json().and_then(|v| v.as_i64()).unwrap_or_default();
        if !failing.is_empty() && !failing.contains(&n) {
            return MockOutcome::value(n);
        }
        let mut attempts = attempts.lock().unwrap();
        let seen = attempts.entry(n).or_default();
        *seen += 1;
        if *seen <= fail_times {
            MockOutcome::fail("FlakyError", format!("input {} attempt {}", n, seen))
        } else {
            MockOutcome::value(n)
        }
    }
}
