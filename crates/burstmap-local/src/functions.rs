// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named functions the localhost backend can run.
//!
//! A function descriptor in a job is the UTF-8 name of a function registered
//! here. Functions take the call input decoded as JSON and return a JSON value
//! or a [`CallError`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use burstmap_core::CallError;
use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use serde_json::{Value, json};

/// Boxed async function body.
pub type LocalFunction =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, CallError>> + Send + Sync>;

/// Name → function map.
#[derive(Clone, Default)]
pub struct FunctionTable {
    functions: BTreeMap<String, LocalFunction>,
}

impl std::fmt::Debug for FunctionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTable")
            .field("functions", &self.names())
            .finish()
    }
}

impl FunctionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with the built-in demo functions:
    ///
    /// | Name | Behavior |
    /// |------|----------|
    /// | `echo` | returns its input |
    /// | `double` | doubles a number |
    /// | `sum` | sums an array of numbers |
    /// | `sleep` | sleeps `input` milliseconds, returns them |
    /// | `fail` | always raises `DemoError` |
    /// | `flaky` | doubles a number, raising `TransientError` 30% of the time |
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table.register("echo", |input| async move { Ok(input) });
        table.register("double", |input| async move {
            let n = as_number(&input)?;
            Ok(json!(n * 2.0))
        });
        table.register("sum", |input| async move {
            let items = input
                .as_array()
                .ok_or_else(|| CallError::execution("TypeError", "expected an array"))?;
            let mut total = 0.0;
            for item in items {
                total += as_number(item)?;
            }
            Ok(json!(total))
        });
        table.register("sleep", |input| async move {
            let ms = input
                .as_u64()
                .ok_or_else(|| CallError::execution("TypeError", "expected milliseconds"))?;
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!(ms))
        });
        table.register("fail", |input| async move {
            Err(CallError::execution("DemoError", format!("refusing {}", input)))
        });
        table.register("flaky", |input| async move {
            let n = as_number(&input)?;
            if rand::thread_rng().gen_bool(0.3) {
                return Err(CallError::execution("TransientError", "worker hiccup"));
            }
            Ok(json!(n * 2.0))
        });
        table
    }

    /// Register (or replace) `name`.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CallError>> + Send + 'static,
    {
        self.functions
            .insert(name.into(), Arc::new(move |input| function(input).boxed()));
    }

    /// Function registered as `name`.
    pub fn get(&self, name: &str) -> Option<LocalFunction> {
        self.functions.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }
}

fn as_number(value: &Value) -> Result<f64, CallError> {
    value
        .as_f64()
        .ok_or_else(|| CallError::execution("TypeError", format!("expected a number, got {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(table: &FunctionTable, name: &str, input: Value) -> Result<Value, CallError> {
        let function = table.get(name).unwrap();
        function(input).await
    }

    #[tokio::test]
    async fn test_builtins() {
        let table = FunctionTable::with_builtins();
        assert_eq!(run(&table, "echo", json!("x")).await.unwrap(), json!("x"));
        assert_eq!(run(&table, "double", json!(21)).await.unwrap(), json!(42.0));
        assert_eq!(run(&table, "sum", json!([1, 2, 3.5])).await.unwrap(), json!(6.5));
        assert_eq!(
            run(&table, "fail", json!(1)).await.unwrap_err().error_code(),
            "EXECUTION_EXCEPTION"
        );
    }

    #[tokio::test]
    async fn test_type_errors_are_call_errors() {
        let table = FunctionTable::with_builtins();
        let err = run(&table, "double", json!("two")).await.unwrap_err();
        assert!(err.to_string().contains("TypeError"));
    }

    #[test]
    fn test_register_and_names() {
        let mut table = FunctionTable::new();
        table.register("b", |v| async move { Ok(v) });
        table.register("a", |v| async move { Ok(v) });
        assert_eq!(table.names(), vec!["a", "b"]);
        assert!(table.get("c").is_none());
    }
}
