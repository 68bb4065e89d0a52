// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! burstmap Local - Demo Runner
//!
//! Maps a built-in function over a sample of numbers on the localhost
//! backend, retrying failed calls, and logs what came back:
//! - storage: in-memory, or SQLite when `BURSTMAP_SQLITE_PATH` is set
//! - monitoring: polling, or push over an in-process bus

use std::sync::Arc;
use std::time::Instant;

use burstmap_core::{
    BackendRegistry, CallInput, CallResult, EngineConfig, FunctionExecutor, LocalPubSub,
    MapOptions, MemoryStorage, MonitorStrategy, PubSub, SqliteStorage, Storage, WaitOptions,
};
use burstmap_local::{FunctionTable, LocalConfig};
use serde_json::json;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burstmap_core=info,burstmap_local=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let engine_config = EngineConfig::from_env()?;
    let config = LocalConfig::from_env()?;

    info!(
        backend = %config.backend,
        function = %config.function,
        sample_size = config.sample_size,
        retries = config.retries,
        strategy = engine_config.monitor_strategy.as_str(),
        "Starting burstmap local runner"
    );

    let storage: Arc<dyn Storage> = match &config.sqlite_path {
        Some(path) => {
            let storage = SqliteStorage::from_path(path).await?;
            info!(path = %path.display(), "Using SQLite storage");
            Arc::new(storage)
        }
        None => Arc::new(MemoryStorage::new()),
    };

    let pubsub: Option<Arc<dyn PubSub>> = match engine_config.monitor_strategy {
        MonitorStrategy::Push => Some(Arc::new(LocalPubSub::default())),
        MonitorStrategy::Polling => None,
    };

    let functions = Arc::new(FunctionTable::with_builtins());
    if functions.get(&config.function).is_none() {
        anyhow::bail!(
            "unknown function {:?} (available: {})",
            config.function,
            functions.names().join(", ")
        );
    }

    let mut registry = BackendRegistry::with_defaults();
    burstmap_local::register(&mut registry, functions);

    let mut builder = FunctionExecutor::builder()
        .config(engine_config)
        .storage(storage)
        .registry(registry)
        .backend_name(&config.backend)
        .backend_option("workers", config.workers.to_string());
    if let Some(pubsub) = pubsub {
        builder = builder.pubsub(pubsub);
    }
    let executor = builder.build().await?;

    let inputs: Vec<CallInput> = (0..config.sample_size)
        .map(|n| CallInput::json(&json!(n)))
        .collect();
    let options = MapOptions::default().with_chunksize(config.chunksize.max(1));

    let started = Instant::now();
    let retrying = executor.retrying(config.retries);
    let units = retrying
        .map(config.function.as_bytes(), inputs, &options)
        .await?;
    retrying
        .wait(&units, WaitOptions::all().with_throw_except(false))
        .await?;

    let mut failed = 0;
    for unit in &units {
        match unit.result(false).await? {
            CallResult::Value(value) => info!(
                input = unit.index(),
                attempts = unit.attempts(),
                value = %value,
                "Call succeeded"
            ),
            CallResult::Futures(children) => info!(
                input = unit.index(),
                children = children.len(),
                "Call spawned nested calls"
            ),
            CallResult::Error(e) => {
                failed += 1;
                error!(input = unit.index(), attempts = unit.attempts(), error = %e, "Call failed");
            }
        }
    }

    info!(
        calls = units.len(),
        failed,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Sample job finished"
    );

    if config.clean {
        let futures: Vec<_> = units.iter().map(|u| u.future()).collect();
        executor.clean(&futures).await?;
    }

    executor.shutdown();
    Ok(())
}
