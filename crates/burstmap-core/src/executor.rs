// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller-facing executor.
//!
//! [`FunctionExecutor`] ties the engine together: it owns the dispatcher,
//! the completion monitor and the wait coordinator, names jobs and exposes
//! the map / call / wait / result API.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use burstmap_core::{BackendRegistry, CallInput, FunctionExecutor, MapOptions, MemoryStorage};
//!
//! let executor = FunctionExecutor::builder()
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .registry(BackendRegistry::with_defaults())
//!     .backend_name("mock")
//!     .build()
//!     .await?;
//!
//! let inputs = (0..10).map(|i| CallInput::json(&serde_json::json!(i))).collect();
//! let futures = executor.map("double", inputs, &MapOptions::default()).await?;
//! let values = executor.get_result(&futures, None).await?;
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::backend::{BackendContext, BackendRegistry, ComputeBackend};
use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::future::{CallFuture, CallResult};
use crate::job::{CallInput, DEFAULT_EXECUTION_TIMEOUT, Job, JobKey};
use crate::ledger::InvocationLedger;
use crate::monitor::CompletionMonitor;
use crate::pubsub::PubSub;
use crate::retry::RetryCoordinator;
use crate::storage::{MemoryStorage, Storage};
use crate::wait::{WaitCoordinator, WaitOptions, WaitOutcome};

/// Runtime name used when none is configured.
pub const DEFAULT_RUNTIME: &str = "default";

/// Per-job dispatch options.
#[derive(Debug, Clone)]
pub struct MapOptions {
    /// Calls per physical invocation.
    pub chunksize: usize,
    /// Execution budget of each call.
    pub execution_timeout: Duration,
    /// Backend runtime override.
    pub runtime: Option<String>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            chunksize: 1,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            runtime: None,
        }
    }
}

impl MapOptions {
    /// Set the chunk size.
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = chunksize;
        self
    }

    /// Set the execution timeout.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Run on `runtime` instead of the executor's default.
    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }
}

/// Builder for creating a [`FunctionExecutor`].
pub struct FunctionExecutorBuilder {
    config: EngineConfig,
    storage: Option<Arc<dyn Storage>>,
    pubsub: Option<Arc<dyn PubSub>>,
    backend: Option<Arc<dyn ComputeBackend>>,
    backend_name: Option<String>,
    registry: BackendRegistry,
    backend_options: HashMap<String, String>,
    executor_id: Option<String>,
    runtime: String,
}

impl std::fmt::Debug for FunctionExecutorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionExecutorBuilder")
            .field("config", &self.config)
            .field("storage", &self.storage.as_ref().map(|_| "..."))
            .field("pubsub", &self.pubsub.as_ref().map(|_| "..."))
            .field("backend", &self.backend.as_ref().map(|b| b.backend_type()))
            .field("backend_name", &self.backend_name)
            .field("executor_id", &self.executor_id)
            .field("runtime", &self.runtime)
            .finish()
    }
}

impl Default for FunctionExecutorBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            storage: None,
            pubsub: None,
            backend: None,
            backend_name: None,
            registry: BackendRegistry::with_defaults(),
            backend_options: HashMap::new(),
            executor_id: None,
            runtime: DEFAULT_RUNTIME.to_string(),
        }
    }
}

impl FunctionExecutorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage shared with the workers (default: in-memory).
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Pub/sub bus (required for the push monitoring strategy).
    pub fn pubsub(mut self, pubsub: Arc<dyn PubSub>) -> Self {
        self.pubsub = Some(pubsub);
        self
    }

    /// Use an already constructed backend.
    pub fn backend(mut self, backend: Arc<dyn ComputeBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Create the backend registered under `name`.
    pub fn backend_name(mut self, name: impl Into<String>) -> Self {
        self.backend_name = Some(name.into());
        self
    }

    /// Registry `backend_name` is looked up in (default: built-in backends).
    pub fn registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Option handed to the backend factory.
    pub fn backend_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.backend_options.insert(key.into(), value.into());
        self
    }

    /// Executor id (default: random).
    pub fn executor_id(mut self, id: impl Into<String>) -> Self {
        self.executor_id = Some(id.into());
        self
    }

    /// Default backend runtime.
    pub fn runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    /// Resolve the backend, size admission to its concurrency and start.
    pub async fn build(self) -> Result<FunctionExecutor> {
        self.config.validate()?;

        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let backend = match (self.backend, self.backend_name) {
            (Some(backend), _) => backend,
            (None, Some(name)) => {
                let mut ctx = BackendContext::new(storage.clone());
                ctx.options = self.backend_options;
                if let Some(pubsub) = &self.pubsub {
                    ctx = ctx.with_pubsub(pubsub.clone());
                }
                self.registry.create(&name, &ctx)?
            }
            (None, None) => {
                return Err(Error::InvalidRequest(format!(
                    "no backend configured (registered: {})",
                    self.registry.names().join(", ")
                )));
            }
        };

        let executor_id = self
            .executor_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());

        let info = backend.runtime_info(&self.runtime).await?;
        let admission = AdmissionController::new(info.max_concurrency);
        let ledger = Arc::new(InvocationLedger::new());
        let monitor =
            CompletionMonitor::new(storage.clone(), self.pubsub, ledger.clone(), &self.config)?;
        let dispatcher = Dispatcher::new(
            backend.clone(),
            storage.clone(),
            admission,
            monitor,
            ledger,
            self.config.clone(),
        );

        info!(
            executor_id = %executor_id,
            backend = backend.backend_type(),
            runtime = %self.runtime,
            capacity = info.max_concurrency,
            strategy = self.config.monitor_strategy.as_str(),
            "Function executor ready"
        );

        Ok(FunctionExecutor {
            inner: Arc::new(ExecutorInner {
                executor_id,
                runtime: self.runtime,
                config: self.config,
                storage,
                backend,
                waiter: WaitCoordinator::new(Some(dispatcher.clone())),
                dispatcher,
                map_jobs: AtomicUsize::new(0),
                async_jobs: AtomicUsize::new(0),
            }),
        })
    }
}

struct ExecutorInner {
    executor_id: String,
    runtime: String,
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    backend: Arc<dyn ComputeBackend>,
    dispatcher: Dispatcher,
    waiter: WaitCoordinator,
    map_jobs: AtomicUsize,
    async_jobs: AtomicUsize,
}

/// Submits jobs and collects their results.
#[derive(Clone)]
pub struct FunctionExecutor {
    inner: Arc<ExecutorInner>,
}

impl FunctionExecutor {
    /// Create a new builder.
    pub fn builder() -> FunctionExecutorBuilder {
        FunctionExecutorBuilder::new()
    }

    /// Id namespacing every job of this executor.
    pub fn executor_id(&self) -> &str {
        &self.inner.executor_id
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Storage shared with the workers.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Compute backend.
    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.inner.backend
    }

    /// Dispatcher behind this executor.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Admission controller sized to the backend's concurrency.
    pub fn admission(&self) -> &AdmissionController {
        self.inner.dispatcher.admission()
    }

    fn next_job_id(&self, prefix: char, counter: &AtomicUsize) -> String {
        format!("{}{:03}", prefix, counter.fetch_add(1, Ordering::SeqCst))
    }

    fn job(
        &self,
        job_id: String,
        function: Vec<u8>,
        inputs: Vec<CallInput>,
        options: &MapOptions,
    ) -> Job {
        Job::new(
            JobKey::new(self.inner.executor_id.clone(), job_id),
            function,
            inputs,
        )
        .with_chunksize(options.chunksize)
        .with_execution_timeout(options.execution_timeout)
        .with_runtime(
            options
                .runtime
                .clone()
                .unwrap_or_else(|| self.inner.runtime.clone()),
        )
    }

    /// Run `function` once per input, returning one future per input.
    pub async fn map(
        &self,
        function: impl Into<Vec<u8>>,
        inputs: Vec<CallInput>,
        options: &MapOptions,
    ) -> Result<Vec<CallFuture>> {
        let job_id = self.next_job_id('M', &self.inner.map_jobs);
        let job = self.job(job_id, function.into(), inputs, options);
        self.inner.dispatcher.dispatch(&job).await
    }

    /// Run `function` once on `input`.
    pub async fn call_async(
        &self,
        function: impl Into<Vec<u8>>,
        input: CallInput,
    ) -> Result<CallFuture> {
        let job_id = self.next_job_id('A', &self.inner.async_jobs);
        let job = self.job(job_id, function.into(), vec![input], &MapOptions::default());
        self.inner
            .dispatcher
            .dispatch(&job)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidRequest("single-call job produced no future".into()))
    }

    /// Map `map_function` over `inputs`, then run `reduce_function` once on
    /// the JSON array of the map results.
    ///
    /// Waits for the whole map phase before dispatching the reduce call. The
    /// returned futures are the map futures followed by the reduce future.
    pub async fn map_reduce(
        &self,
        map_function: impl Into<Vec<u8>>,
        inputs: Vec<CallInput>,
        reduce_function: impl Into<Vec<u8>>,
        options: &MapOptions,
    ) -> Result<Vec<CallFuture>> {
        let mut futures = self.map(map_function, inputs, options).await?;
        let values = self.get_result(&futures, None).await?;

        let reduce_options = MapOptions {
            chunksize: 1,
            ..options.clone()
        };
        let reduce = self
            .map(
                reduce_function,
                vec![CallInput::json(&Value::Array(values))],
                &reduce_options,
            )
            .await?;
        futures.extend(reduce);
        Ok(futures)
    }

    /// Wait on `futures` (see [`WaitCoordinator::wait`]).
    pub async fn wait(&self, futures: &[CallFuture], options: WaitOptions) -> Result<WaitOutcome> {
        self.inner.waiter.wait(futures, options).await
    }

    /// Wait for all `futures` and return their values in call order.
    ///
    /// Calls that spawned nested calls resolve to the JSON array of their
    /// children's values. The first failed call is raised.
    pub async fn get_result(
        &self,
        futures: &[CallFuture],
        timeout: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let mut options = WaitOptions::all();
        if let Some(timeout) = timeout {
            options = options.with_timeout(timeout).fail_on_timeout();
        }
        self.wait(futures, options).await?;

        let mut values = Vec::with_capacity(futures.len());
        for future in futures {
            values.push(resolve(future.clone()).await?);
        }
        Ok(values)
    }

    /// Retry coordinator re-dispatching failed calls up to `retries` times.
    pub fn retrying(&self, retries: u32) -> RetryCoordinator {
        RetryCoordinator::new(self.clone(), retries)
    }

    /// Delete every storage object of the jobs `futures` belong to,
    /// nested jobs included. Returns the number of objects deleted.
    pub async fn clean(&self, futures: &[CallFuture]) -> Result<usize> {
        let mut jobs = BTreeSet::new();
        let mut stack: Vec<CallFuture> = futures.to_vec();
        while let Some(future) = stack.pop() {
            jobs.insert(future.job_key());
            stack.extend(future.children());
        }

        let mut deleted = 0;
        for job in &jobs {
            let namespace = job.namespace();
            // Nested jobs are named `{job}-{call}`
            for prefix in [format!("{}/", namespace), format!("{}-", namespace)] {
                for key in self.inner.storage.list_keys(&prefix).await? {
                    self.inner.storage.delete(&key).await?;
                    deleted += 1;
                }
            }
        }

        info!(jobs = jobs.len(), objects = deleted, "Cleaned job storage");
        Ok(deleted)
    }

    /// Stop every job, observer and invoker. Later dispatches fail.
    pub fn shutdown(&self) {
        let active = self.inner.dispatcher.active_jobs();
        if active > 0 {
            warn!(active_jobs = active, "Shutting down with jobs still dispatching");
        }
        self.inner.dispatcher.shutdown();
        info!(executor_id = %self.inner.executor_id, "Function executor shut down");
    }
}

fn resolve(future: CallFuture) -> BoxFuture<'static, Result<Value>> {
    async move {
        match future.result(true).await? {
            CallResult::Value(value) => Ok(value),
            CallResult::Futures(children) => {
                let mut values = Vec::with_capacity(children.len());
                for child in children {
                    values.push(resolve(child).await?);
                }
                Ok(Value::Array(values))
            }
            CallResult::Error(e) => Err(Error::call(future.key(), e)),
        }
    }
    .boxed()
}
