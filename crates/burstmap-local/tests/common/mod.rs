// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for burstmap-local integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use burstmap_core::{
    BackendRegistry, CallInput, EngineConfig, FunctionExecutor, MemoryStorage, Storage,
};
use burstmap_local::{FunctionTable, LocalBackend};
use serde_json::json;

/// Engine configuration with short intervals suited to tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_monitor_poll_interval(Duration::from_millis(5))
        .with_status_polling(Duration::from_millis(5), 4000)
        .with_result_polling(Duration::from_millis(5), 40)
        .with_rejection_backoff(Duration::from_millis(1), Duration::from_millis(10))
}

/// Numeric inputs `0..n`.
pub fn numbers(n: usize) -> Vec<CallInput> {
    (0..n).map(|i| CallInput::json(&json!(i))).collect()
}

/// Executor resolving the `localhost` backend through the registry.
pub async fn registry_executor(storage: Arc<dyn Storage>, workers: usize) -> FunctionExecutor {
    let mut registry = BackendRegistry::with_defaults();
    burstmap_local::register(&mut registry, Arc::new(FunctionTable::with_builtins()));

    FunctionExecutor::builder()
        .config(fast_config())
        .storage(storage)
        .registry(registry)
        .backend_name(burstmap_local::BACKEND_NAME)
        .backend_option("workers", workers.to_string())
        .executor_id("local")
        .build()
        .await
        .unwrap()
}

/// Executor over a directly constructed backend the test keeps a handle to.
pub async fn direct_executor(
    functions: FunctionTable,
    workers: usize,
) -> (FunctionExecutor, Arc<LocalBackend>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let backend = Arc::new(
        LocalBackend::new(storage.clone(), Arc::new(functions)).with_workers(workers),
    );
    let executor = FunctionExecutor::builder()
        .config(fast_config())
        .storage(storage.clone())
        .backend(backend.clone())
        .executor_id("local")
        .build()
        .await
        .unwrap();
    (executor, backend, storage)
}
