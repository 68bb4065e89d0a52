// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! burstmap Core - Job Dispatch and Completion Tracking
//!
//! This crate submits batches of independent calls ("jobs") to an elastic,
//! quota-limited compute backend and tracks every call to its result.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         FunctionExecutor                             │
//! │        map / call_async / map_reduce / wait / get_result             │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │ Job                    ▲ CallFuture              │ retries
//!        ▼                        │                           ▼
//! ┌─────────────────┐   ┌──────────────────┐   ┌──────────────────────┐
//! │   Dispatcher    │   │  WaitCoordinator │   │   RetryCoordinator   │
//! │ direct/deferred │   │ ALL / ANY / ALWAYS│   │ bounded re-dispatch  │
//! └─────────────────┘   └──────────────────┘   └──────────────────────┘
//!   │ tokens   │ invoke            ▲ state changes
//!   ▼          ▼                   │
//! ┌───────────┐ ┌─────────────┐  ┌──────────────────────────────────────┐
//! │ Admission │ │   Compute   │  │          CompletionMonitor           │
//! │ Controller│ │   Backend   │  │ polling (list_keys) or push (topic)  │
//! └───────────┘ └─────────────┘  └──────────────────────────────────────┘
//!       ▲             │ workers report          ▲
//!       │             ▼                         │
//!       │        ┌──────────────────────────────┴───┐
//!       └────────│  Storage  +  PubSub (optional)   │
//!  released on   └──────────────────────────────────┘
//!  every `end`
//! ```
//!
//! # Call lifecycle
//!
//! | State | Entered when |
//! |-------|--------------|
//! | `New` | the dispatcher created the future |
//! | `Invoked` | the backend accepted the call's chunk |
//! | `Running` | the monitor saw the call's init marker |
//! | `Ready` | the monitor saw the call's status document |
//! | `Success` | the output was fetched and is a plain value |
//! | `Futures` | the call spawned nested calls |
//! | `Error` | the call failed, timed out or was never dispatched |
//!
//! States only move forward.
//!
//! # Storage layout
//!
//! Workers report into `{executor_id}/{job_id}/{call_id}/{init|status|output}`.
//! With the push strategy they also publish events on `burstmap-{executor_id}-{job_id}`.

#![deny(missing_docs)]

/// Admission tokens bounding outstanding invocations.
pub mod admission;

/// Compute backend trait, mock backend and registry.
pub mod backend;

/// Engine configuration loaded from environment variables.
pub mod config;

/// Turns jobs into invocations under admission control.
pub mod dispatcher;

/// Error types for engine and call failures.
pub mod error;

/// Caller-facing executor.
pub mod executor;

/// Per-call futures and their state machine.
pub mod future;

/// Jobs, calls and their identities.
pub mod job;

/// Admission tokens held by invoked chunks.
pub mod ledger;

/// Completion monitoring (polling and push).
pub mod monitor;

/// Wire format of one invocation.
pub mod payload;

/// Topic-based notification bus.
pub mod pubsub;

/// Bounded re-submission of failed calls.
pub mod retry;

/// Status, output and event documents.
pub mod status;

/// Byte-oriented object storage.
pub mod storage;

/// Waiting on futures with completion policies.
pub mod wait;

/// Worker-side reporting helpers used by backends.
pub mod worker;

pub use admission::{Admission, AdmissionController, AdmissionToken};
pub use backend::{
    BackendContext, BackendError, BackendRegistry, ComputeBackend, Invocation, MockBackend,
    MockCall, MockOutcome, RuntimeInfo,
};
pub use config::{ConfigError, EngineConfig, MonitorStrategy};
pub use dispatcher::Dispatcher;
pub use error::{CallError, Error, Result};
pub use executor::{FunctionExecutor, FunctionExecutorBuilder, MapOptions};
pub use future::{CallFuture, CallResult, CallState, CallStats};
pub use job::{Call, CallInput, CallKey, Job, JobKey};
pub use monitor::CompletionMonitor;
pub use pubsub::{LocalPubSub, PubSub};
pub use retry::{RetryCoordinator, RetryOutcome, RetryableUnit};
pub use status::{CallOutput, CallStatus, CompletionEvent, EventKind};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use wait::{WaitCoordinator, WaitOptions, WaitOutcome, WaitPolicy, WaitProgress};
pub use worker::CallReporter;

/// Engine version checked against the backend runtime before dispatch.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
