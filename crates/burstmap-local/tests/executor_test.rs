// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests running the executor on the localhost backend.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use burstmap_core::{
    BackendError, CallError, CallInput, CallResult, ComputeBackend, Error, MapOptions, MemoryStorage,
    SqliteStorage, Storage, WaitOptions,
};
use burstmap_local::FunctionTable;
use common::{direct_executor, numbers, registry_executor};
use serde_json::json;

#[tokio::test]
async fn test_map_over_registry_backend() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    let executor = registry_executor(storage, 2).await;
    assert_eq!(executor.backend().backend_type(), "localhost");
    assert_eq!(executor.admission().capacity(), 2);

    let futures = executor
        .map("double", numbers(12), &MapOptions::default())
        .await
        .unwrap();
    let values = executor.get_result(&futures, None).await.unwrap();

    let expected: Vec<_> = (0..12).map(|i| json!(f64::from(i) * 2.0)).collect();
    assert_eq!(values, expected);
    executor.shutdown();
}

#[tokio::test]
async fn test_worker_slots_bound_concurrency() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut functions = FunctionTable::new();
    {
        let running = running.clone();
        let peak = peak.clone();
        functions.register("busy", move |input| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(input)
            }
        });
    }

    let (executor, backend, _storage) = direct_executor(functions, 3).await;
    let futures = executor
        .map("busy", numbers(15), &MapOptions::default().with_chunksize(2))
        .await
        .unwrap();
    executor.get_result(&futures, None).await.unwrap();

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(backend.accepted(), 8);
    assert_eq!(backend.active(), 0);
    executor.shutdown();
}

#[tokio::test]
async fn test_unknown_function_is_irrecoverable() {
    let (executor, _backend, _storage) = direct_executor(FunctionTable::with_builtins(), 2).await;

    let err = executor
        .map("missing", numbers(2), &MapOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::InvocationFailed(_))));
    assert_eq!(executor.admission().outstanding(), 0);
    executor.shutdown();
}

#[tokio::test]
async fn test_execution_timeout_reported_as_call_error() {
    let (executor, _backend, _storage) = direct_executor(FunctionTable::with_builtins(), 2).await;

    let future = executor
        .map(
            "sleep",
            vec![CallInput::json(&json!(10_000))],
            &MapOptions::default().with_execution_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap()
        .remove(0);

    let outcome = executor
        .wait(&[future.clone()], WaitOptions::all().with_throw_except(false))
        .await
        .unwrap();
    assert!(outcome.is_complete());
    match future.result(false).await.unwrap() {
        CallResult::Error(CallError::ExecutionTimeout { timeout_secs }) => {
            assert_eq!(timeout_secs, 1)
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    executor.shutdown();
}

#[tokio::test]
async fn test_failures_exhaust_retries() {
    let (executor, backend, _storage) = direct_executor(FunctionTable::with_builtins(), 4).await;

    let retrying = executor.retrying(2);
    let units = retrying
        .map("fail", numbers(2), &MapOptions::default())
        .await
        .unwrap();
    let outcome = retrying
        .wait(&units, WaitOptions::all().with_throw_except(false))
        .await
        .unwrap();
    assert_eq!(outcome.done.len(), 2);

    for unit in &units {
        assert!(unit.is_exhausted());
        let result = unit.result(false).await.unwrap();
        assert!(matches!(
            result.error(),
            Some(CallError::RetryBoundExceeded { attempts: 3, .. })
        ));
    }
    // One original job plus two retries per input
    assert_eq!(backend.accepted(), 6);
    executor.shutdown();
}

#[tokio::test]
async fn test_map_reduce_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let storage: Arc<dyn Storage> =
        Arc::new(SqliteStorage::from_path(dir.path().join("local.db")).await.unwrap());
    let executor = registry_executor(storage.clone(), 4).await;

    let futures = executor
        .map_reduce("double", numbers(5), "sum", &MapOptions::default())
        .await
        .unwrap();
    assert_eq!(futures.len(), 6);

    let total = executor
        .get_result(&futures[5..], None)
        .await
        .unwrap()
        .remove(0);
    assert_eq!(total, json!(20.0));

    executor.clean(&futures).await.unwrap();
    assert!(storage.list_keys("local/").await.unwrap().is_empty());
    executor.shutdown();
}
