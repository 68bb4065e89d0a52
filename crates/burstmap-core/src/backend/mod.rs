// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute backends.
//!
//! The engine talks to backends only through [`ComputeBackend`]. Backends are
//! chosen by name from a [`BackendRegistry`].

/// Scripted in-process backend for tests and demos.
pub mod mock;

/// Name-keyed backend factories.
pub mod registry;

/// Backend trait and wire-level types.
pub mod traits;

pub use mock::{MockBackend, MockCall, MockOutcome};
pub use registry::{BackendContext, BackendFactory, BackendRegistry};
pub use traits::{BackendError, ComputeBackend, Invocation, RuntimeInfo};
