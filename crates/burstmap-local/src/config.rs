// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the burstmap-local runner.

use std::path::PathBuf;

use crate::backend::{BACKEND_NAME, DEFAULT_WORKERS};

/// Runner configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Registry name of the backend to run on.
    pub backend: String,
    /// SQLite database to store call data in; in-memory storage when unset.
    pub sqlite_path: Option<PathBuf>,
    /// Worker slots of the localhost backend.
    pub workers: usize,
    /// Function the sample job maps.
    pub function: String,
    /// Number of inputs of the sample job.
    pub sample_size: usize,
    /// Calls per invocation.
    pub chunksize: usize,
    /// Retries per failed input.
    pub retries: u32,
    /// Delete call data once the results are collected.
    pub clean: bool,
}

impl LocalConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `BURSTMAP_BACKEND` (default: localhost)
    /// - `BURSTMAP_SQLITE_PATH` (default: unset, in-memory storage)
    /// - `BURSTMAP_LOCAL_WORKERS` (default: 8)
    /// - `BURSTMAP_FUNCTION` (default: flaky)
    /// - `BURSTMAP_SAMPLE_SIZE` (default: 20)
    /// - `BURSTMAP_CHUNKSIZE` (default: 1)
    /// - `BURSTMAP_RETRIES` (default: 2)
    /// - `BURSTMAP_CLEAN` (default: true)
    pub fn from_env() -> Result<Self, LocalConfigError> {
        let backend = std::env::var("BURSTMAP_BACKEND").unwrap_or_else(|_| BACKEND_NAME.to_string());

        let sqlite_path = std::env::var("BURSTMAP_SQLITE_PATH")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        let workers = parse("BURSTMAP_LOCAL_WORKERS", DEFAULT_WORKERS)?;
        if workers == 0 {
            return Err(LocalConfigError::Invalid("BURSTMAP_LOCAL_WORKERS", "0".into()));
        }

        let function = std::env::var("BURSTMAP_FUNCTION").unwrap_or_else(|_| "flaky".to_string());
        let sample_size = parse("BURSTMAP_SAMPLE_SIZE", 20)?;
        let chunksize = parse("BURSTMAP_CHUNKSIZE", 1)?;
        let retries = parse("BURSTMAP_RETRIES", 2)?;

        let clean = std::env::var("BURSTMAP_CLEAN")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            backend,
            sqlite_path,
            workers,
            function,
            sample_size,
            chunksize,
            retries,
            clean,
        })
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, LocalConfigError> {
    match std::env::var(var) {
        Ok(v) => v.parse().map_err(|_| LocalConfigError::Invalid(var, v)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum LocalConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "BURSTMAP_BACKEND",
        "BURSTMAP_SQLITE_PATH",
        "BURSTMAP_LOCAL_WORKERS",
        "BURSTMAP_FUNCTION",
        "BURSTMAP_SAMPLE_SIZE",
        "BURSTMAP_CHUNKSIZE",
        "BURSTMAP_RETRIES",
        "BURSTMAP_CLEAN",
    ];

    /// Clears the runner's env vars and restores them on drop.
    struct EnvGuard(Vec<(&'static str, Option<String>)>);

    impl EnvGuard {
        fn clean() -> Self {
            let saved = VARS.iter().map(|v| (*v, env::var(v).ok())).collect();
            for var in VARS {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe { env::remove_var(var) };
            }
            Self(saved)
        }

        fn set(&self, key: &str, value: &str) {
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.0.drain(..) {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(key, v),
                        None => env::remove_var(key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = LocalConfig::from_env().unwrap();
        assert_eq!(config.backend, "localhost");
        assert_eq!(config.sqlite_path, None);
        assert_eq!(config.workers, 8);
        assert_eq!(config.function, "flaky");
        assert_eq!(config.sample_size, 20);
        assert_eq!(config.retries, 2);
        assert!(config.clean);
    }

    #[test]
    fn test_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("BURSTMAP_BACKEND", "mock");
        guard.set("BURSTMAP_SQLITE_PATH", ".data/burstmap.db");
        guard.set("BURSTMAP_LOCAL_WORKERS", "2");
        guard.set("BURSTMAP_RETRIES", "0");
        guard.set("BURSTMAP_CLEAN", "false");

        let config = LocalConfig::from_env().unwrap();
        assert_eq!(config.backend, "mock");
        assert_eq!(config.sqlite_path, Some(PathBuf::from(".data/burstmap.db")));
        assert_eq!(config.workers, 2);
        assert_eq!(config.retries, 0);
        assert!(!config.clean);
    }

    #[test]
    fn test_invalid_number() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("BURSTMAP_SAMPLE_SIZE", "lots");

        let err = LocalConfig::from_env().unwrap_err();
        assert!(matches!(err, LocalConfigError::Invalid("BURSTMAP_SAMPLE_SIZE", _)));
    }
}
