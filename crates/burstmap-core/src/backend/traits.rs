// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute backend trait definitions.
//!
//! Defines the abstract interface the dispatcher invokes chunks against.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from backend operations.
///
/// Quota rejections are not errors; they are reported as
/// [`Invocation::Rejected`]. Every `BackendError` returned by
/// [`ComputeBackend::invoke`] is treated as irrecoverable for the job.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// No backend is registered under the requested name.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    /// The invocation payload could not be decoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The backend refused the function or failed to start it.
    #[error("Invocation failed: {0}")]
    InvocationFailed(String),

    /// The backend was shut down.
    #[error("Backend is shut down")]
    ShutDown,

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Outcome of a single invocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// The backend accepted the chunk and will execute it.
    Accepted {
        /// Backend-assigned activation id.
        activation_id: String,
    },
    /// The backend has no capacity right now; the chunk should be retried later.
    Rejected,
}

/// Capabilities of a backend runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// Maximum concurrent invocations the backend accepts.
    pub max_concurrency: usize,
    /// Maximum execution time the backend allows per invocation.
    pub timeout: Duration,
    /// Engine version the runtime's workers were built with.
    pub engine_version: String,
}

/// Trait for compute backends.
///
/// Backends are pure execution targets: they receive an encoded
/// [`InvocationPayload`](crate::payload::InvocationPayload), run its calls
/// somewhere, and report through storage (and optionally pub/sub) using the
/// per-call key layout. They never touch engine state.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Backend type identifier (e.g., "mock", "localhost").
    fn backend_type(&self) -> &'static str;

    /// Describe the runtime `runtime` on this backend.
    async fn runtime_info(&self, runtime: &str) -> Result<RuntimeInfo>;

    /// Ask the backend to execute one encoded invocation payload.
    async fn invoke(&self, payload: &[u8]) -> Result<Invocation>;
}
