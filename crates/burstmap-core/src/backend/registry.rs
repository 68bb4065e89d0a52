// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend registry.
//!
//! Backends are selected by name through an explicit registry of factories
//! rather than by loading modules dynamically.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::mock::MockBackend;
use super::traits::{BackendError, ComputeBackend, Result};
use crate::pubsub::PubSub;
use crate::storage::Storage;

/// Collaborators and options handed to backend factories.
#[derive(Clone)]
pub struct BackendContext {
    /// Storage workers report into.
    pub storage: Arc<dyn Storage>,
    /// Bus completion events are published on, if push monitoring is used.
    pub pubsub: Option<Arc<dyn PubSub>>,
    /// Backend-specific options (e.g. `max_concurrency`).
    pub options: HashMap<String, String>,
}

impl BackendContext {
    /// Create a context without pub/sub or options.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            pubsub: None,
            options: HashMap::new(),
        }
    }

    /// Attach a pub/sub bus.
    pub fn with_pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Set a backend option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Parse option `key`, falling back to `default` when unset.
    pub fn option<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.options.get(key) {
            Some(v) => v
                .parse()
                .map_err(|_| BackendError::Other(format!("invalid backend option {}={}", key, v))),
            None => Ok(default),
        }
    }
}

/// Factory creating a backend from a context.
pub type BackendFactory =
    Arc<dyn Fn(&BackendContext) -> Result<Arc<dyn ComputeBackend>> + Send + Sync>;

/// Name → factory map of available backends.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in `mock` backend.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("mock", |ctx| {
            let mut backend = MockBackend::new(ctx.storage.clone())
                .with_max_concurrency(ctx.option("max_concurrency", 1000)?);
            if let Some(pubsub) = &ctx.pubsub {
                backend = backend.with_pubsub(pubsub.clone());
            }
            Ok(Arc::new(backend) as Arc<dyn ComputeBackend>)
        });
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&BackendContext) -> Result<Arc<dyn ComputeBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiate the backend registered as `name`.
    pub fn create(&self, name: &str, ctx: &BackendContext) -> Result<Arc<dyn ComputeBackend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BackendError::UnknownBackend(name.to_string()))?;
        factory(ctx)
    }

    /// Registered backend names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
