// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! burstmap Local - Localhost Compute Backend
//!
//! Runs burstmap jobs on the local machine. Functions are named async Rust
//! closures kept in a [`FunctionTable`]; the [`LocalBackend`] executes chunks
//! on tokio tasks with a fixed number of worker slots and rejects invocations
//! beyond them, so the engine's admission and backoff paths behave as they do
//! against a throttling cloud backend.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use burstmap_core::{BackendRegistry, FunctionExecutor};
//! use burstmap_local::{FunctionTable, register};
//!
//! let mut registry = BackendRegistry::with_defaults();
//! register(&mut registry, Arc::new(FunctionTable::with_builtins()));
//!
//! let executor = FunctionExecutor::builder()
//!     .registry(registry)
//!     .backend_name("localhost")
//!     .backend_option("workers", "4")
//!     .build()
//!     .await?;
//! ```

#![deny(missing_docs)]

/// Localhost backend and its registry entry.
pub mod backend;

/// Runner configuration loaded from environment variables.
pub mod config;

/// Named functions the backend runs.
pub mod functions;

pub use backend::{BACKEND_NAME, LocalBackend, register};
pub use config::{LocalConfig, LocalConfigError};
pub use functions::{FunctionTable, LocalFunction};
