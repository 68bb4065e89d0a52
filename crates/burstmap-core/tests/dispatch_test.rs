// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatch tests: call ids, chunking, admission and dispatch failures.

mod common;

use std::sync::Arc;
use std::time::Duration;

use burstmap_core::{
    BackendError, CallError, CallInput, CallState, Error, Job, JobKey, MapOptions, MemoryStorage,
    MockBackend, MockOutcome,
};
use common::{TestContext, fast_config, numbers};
use serde_json::json;

#[tokio::test]
async fn test_call_ids_follow_input_order() {
    let ctx = TestContext::new(|b| b).await;

    let futures = ctx
        .executor
        .map("f", numbers(12), &MapOptions::default())
        .await
        .unwrap();

    let ids: Vec<&str> = futures.iter().map(|f| f.call_id()).collect();
    let expected: Vec<String> = (0..12).map(|i| format!("{:05}", i)).collect();
    assert_eq!(ids, expected);

    let values = ctx.executor.get_result(&futures, None).await.unwrap();
    assert_eq!(values, (0..12).map(|i| json!(i)).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_chunks_share_one_invocation() {
    let ctx = TestContext::new(|b| b).await;

    let futures = ctx
        .executor
        .map("f", numbers(10), &MapOptions::default().with_chunksize(3))
        .await
        .unwrap();
    ctx.executor.get_result(&futures, None).await.unwrap();

    assert_eq!(ctx.backend.invocation_count(), 4);
    assert_eq!(ctx.backend.calls_started(), 10);

    // One activation per chunk
    let activation = |i: usize| futures[i].activation_id().unwrap();
    assert_eq!(activation(0), activation(2));
    assert_ne!(activation(2), activation(3));
    assert_ne!(activation(8), activation(9));
}

#[tokio::test]
async fn test_token_invariant_under_load() {
    let ctx = TestContext::new(|b| {
        b.with_max_concurrency(10)
            .with_handler(|call| MockOutcome::value(call.json().unwrap()).after(Duration::from_millis(1)))
    })
    .await;
    assert_eq!(ctx.executor.admission().capacity(), 10);

    let futures = ctx
        .executor
        .map("f", numbers(1000), &MapOptions::default())
        .await
        .unwrap();
    let values = ctx.executor.get_result(&futures, None).await.unwrap();
    assert_eq!(values.len(), 1000);

    ctx.wait_for_released_tokens().await;
    let admission = ctx.executor.admission();
    assert!(admission.peak_outstanding() <= 10);
    assert!(ctx.backend.peak_active() <= 10);
    assert_eq!(admission.acquired_total(), admission.released_total());
    assert_eq!(ctx.backend.calls_started(), 1000);
}

#[tokio::test]
async fn test_rejected_chunks_are_retried_whole() {
    let ctx = TestContext::new(|b| b.with_forced_rejections(4)).await;

    let futures = ctx
        .executor
        .map("f", numbers(6), &MapOptions::default().with_chunksize(2))
        .await
        .unwrap();
    ctx.executor.get_result(&futures, None).await.unwrap();

    assert_eq!(ctx.backend.rejection_count(), 4);
    assert_eq!(ctx.backend.invocation_count(), 3);
    assert_eq!(ctx.backend.calls_started(), 6);
}

#[tokio::test]
async fn test_protocol_mismatch_aborts_before_admission() {
    let ctx = TestContext::new(|b| b.with_engine_version("0.1.0-legacy")).await;

    let err = ctx
        .executor
        .map("f", numbers(3), &MapOptions::default())
        .await
        .unwrap_err();

    match err {
        Error::ProtocolMismatch { local, runtime } => {
            assert_eq!(local, burstmap_core::ENGINE_VERSION);
            assert_eq!(runtime, "0.1.0-legacy");
        }
        other => panic!("expected protocol mismatch, got {}", other),
    }
    assert_eq!(ctx.backend.invocation_count(), 0);
    assert_eq!(ctx.executor.admission().acquired_total(), 0);
}

#[tokio::test]
async fn test_irrecoverable_dispatch_error_fails_job() {
    let ctx = TestContext::new(|b| b.failing_invocations()).await;

    let err = ctx
        .executor
        .map("f", numbers(3), &MapOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Backend(BackendError::InvocationFailed(_))));
    assert_eq!(ctx.executor.admission().outstanding(), 0);
}

#[tokio::test]
async fn test_stop_job_fails_queued_calls() {
    let storage = Arc::new(MemoryStorage::new());
    // Capacity 1: the first chunk goes direct, the rest are deferred
    let backend = Arc::new(
        MockBackend::new(storage.clone())
            .with_max_concurrency(1)
            .with_handler(|_| MockOutcome::Hang),
    );
    let executor = burstmap_core::FunctionExecutor::builder()
        .config(fast_config())
        .storage(storage)
        .backend(backend.clone())
        .executor_id("test")
        .build()
        .await
        .unwrap();

    let futures = executor
        .map("f", numbers(3), &MapOptions::default())
        .await
        .unwrap();
    assert_eq!(executor.dispatcher().active_jobs(), 1);

    executor.dispatcher().stop_job(&JobKey::new("test", "M000"));
    for f in &futures[1..] {
        assert_eq!(f.state(), CallState::Error);
        let result = f.result(false).await.unwrap();
        assert!(matches!(result.error(), Some(CallError::DispatchFailed { .. })));
    }
    assert_eq!(backend.invocation_count(), 1);
    assert_eq!(futures[0].state(), CallState::Invoked);
    assert_eq!(executor.admission().outstanding(), 1);
    backend.shutdown();
}

#[tokio::test]
async fn test_stopped_job_holds_capacity_until_its_calls_time_out() {
    let ctx = TestContext::with_config(
        fast_config().with_timeout_grace(Duration::from_millis(50)),
        |b| {
            b.with_max_concurrency(1)
                .with_handler(|call| match call.call.job_id.as_str() {
                    "M000" => MockOutcome::Hang,
                    _ => MockOutcome::value(call.json().unwrap()),
                })
        },
    )
    .await;

    let stuck = ctx
        .executor
        .map(
            "f",
            numbers(1),
            &MapOptions::default().with_execution_timeout(Duration::from_secs(1)),
        )
        .await
        .unwrap();
    ctx.executor
        .dispatcher()
        .stop_job(&JobKey::new("test", "M000"));

    let next = ctx
        .executor
        .map("f", numbers(2), &MapOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ctx.backend.invocation_count(), 1);
    assert!(next.iter().all(|f| f.state() == CallState::New));

    let values = ctx.executor.get_result(&next, None).await.unwrap();
    assert_eq!(values, vec![json!(0), json!(1)]);
    assert!(matches!(
        stuck[0].result(false).await.unwrap().error(),
        Some(CallError::ExecutionTimeout { timeout_secs: 1 })
    ));
    assert!(ctx.backend.peak_active() <= 1);
    assert!(ctx.executor.admission().peak_outstanding() <= 1);
}

#[tokio::test]
async fn test_execution_timeout_clamped_to_runtime() {
    let ctx = TestContext::with_config(
        fast_config().with_timeout_grace(Duration::from_millis(50)),
        |b| b.with_timeout(Duration::from_secs(1)).with_handler(|_| MockOutcome::Hang),
    )
    .await;

    let future = ctx
        .executor
        .map(
            "f",
            vec![CallInput::json(&json!(1))],
            &MapOptions::default().with_execution_timeout(Duration::from_secs(3600)),
        )
        .await
        .unwrap()
        .remove(0);

    assert_eq!(future.execution_timeout(), Duration::from_secs(1));
    let result = tokio::time::timeout(Duration::from_secs(5), future.result(false))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        result.error(),
        Some(&CallError::ExecutionTimeout { timeout_secs: 1 })
    );
    ctx.wait_for_released_tokens().await;
}

#[tokio::test]
async fn test_job_descriptor_is_not_mutated() {
    let ctx = TestContext::new(|b| b).await;
    let job = Job::new(JobKey::new("test", "J000"), b"f".to_vec(), numbers(4)).with_chunksize(2);
    let before = format!("{:?}", job);

    ctx.executor.dispatcher().dispatch(&job).await.unwrap();
    assert_eq!(format!("{:?}", job), before);
}
