// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait policy, timeout, cancellation and push monitoring tests.

mod common;

use std::time::Duration;

use burstmap_core::{
    CallFuture, CallInput, Error, JobKey, MapOptions, MockOutcome, WaitOptions, WaitProgress,
};
use common::{TestContext, numbers};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Inputs 1 and 5 finish after that many seconds, 0 never finishes.
async fn trio() -> (TestContext, Vec<CallFuture>) {
    let ctx = TestContext::new(|b| {
        b.with_handler(|call| match call.json().and_then(|v| v.as_u64()) {
            Some(0) | None => MockOutcome::Hang,
            Some(secs) => MockOutcome::value(secs).after(Duration::from_secs(secs)),
        })
    })
    .await;
    let inputs = [1, 5, 0].iter().map(|n| CallInput::json(&json!(n))).collect();
    let futures = ctx
        .executor
        .map("f", inputs, &MapOptions::default())
        .await
        .unwrap();
    (ctx, futures)
}

#[tokio::test(start_paused = true)]
async fn test_all_completed_returns_partial_sets_at_timeout() {
    let (ctx, futures) = trio().await;
    let started = Instant::now();

    let outcome = ctx
        .executor
        .wait(&futures, WaitOptions::all().with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100));
    assert_eq!(outcome.done.len(), 1);
    assert!(outcome.done[0].same_as(&futures[0]));
    assert_eq!(outcome.pending.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_any_completed_returns_after_first() {
    let (ctx, futures) = trio().await;
    let started = Instant::now();

    let outcome = ctx
        .executor
        .wait(&futures, WaitOptions::any().with_timeout(Duration::from_secs(2)))
        .await
        .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100));
    assert_eq!(outcome.done.len(), 1);
    assert!(outcome.done[0].same_as(&futures[0]));
}

#[tokio::test(start_paused = true)]
async fn test_always_returns_immediately() {
    let (ctx, futures) = trio().await;
    let started = Instant::now();

    let outcome = ctx
        .executor
        .wait(&futures, WaitOptions::always())
        .await
        .unwrap();

    assert_eq!(started.elapsed(), Duration::ZERO);
    assert!(outcome.done.is_empty());
    assert_eq!(outcome.pending.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_as_error() {
    let (ctx, futures) = trio().await;

    let err = ctx
        .executor
        .wait(
            &futures,
            WaitOptions::all()
                .with_timeout(Duration::from_secs(2))
                .fail_on_timeout(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::WaitTimeout { not_done: 2, total: 3 }));
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_job() {
    let (ctx, futures) = trio().await;
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        canceller.cancel();
    });

    let err = ctx
        .executor
        .wait(&futures, WaitOptions::all().with_cancel(token))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Interrupted { not_done: 3 }));
    let job = JobKey::new("test", "M000");
    assert!(!ctx.executor.dispatcher().monitor().is_watching(&job));
    assert_eq!(ctx.executor.dispatcher().active_jobs(), 0);
    // Invoked calls keep occupying the backend until they end
    assert_eq!(ctx.executor.admission().outstanding(), 3);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(ctx.executor.admission().outstanding(), 2);
}

#[tokio::test]
async fn test_progress_reaches_total() {
    let ctx = TestContext::new(|b| b).await;
    let futures = ctx
        .executor
        .map("f", numbers(5), &MapOptions::default())
        .await
        .unwrap();
    let (tx, rx) = watch::channel(WaitProgress::default());

    ctx.executor
        .wait(&futures, WaitOptions::all().with_progress(tx))
        .await
        .unwrap();

    assert_eq!(*rx.borrow(), WaitProgress { done: 5, total: 5 });
}

#[tokio::test]
async fn test_push_strategy_collects_results() {
    let ctx = TestContext::push(|b| b).await;

    let futures = ctx
        .executor
        .map("f", numbers(20), &MapOptions::default().with_chunksize(4))
        .await
        .unwrap();
    let values = ctx
        .executor
        .get_result(&futures, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(values, (0..20).map(|i| json!(i)).collect::<Vec<_>>());

    // The watch unsubscribes once every end event arrived
    let monitor = ctx.executor.dispatcher().monitor();
    tokio::time::timeout(Duration::from_secs(5), async {
        while monitor.active_watches() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    ctx.wait_for_released_tokens().await;
}

#[tokio::test]
async fn test_push_strategy_follows_nested_calls() {
    let ctx = TestContext::push(|b| {
        b.with_handler(|_| {
            MockOutcome::Spawn(vec![MockOutcome::value("a"), MockOutcome::value("b")])
        })
    })
    .await;

    let future = ctx
        .executor
        .call_async("f", CallInput::json(&json!(null)))
        .await
        .unwrap();
    let values = ctx
        .executor
        .get_result(&[future.clone()], Some(Duration::from_secs(10)))
        .await
        .unwrap();

    assert_eq!(values, vec![json!(["a", "b"])]);
    assert_eq!(future.children().len(), 2);
}
