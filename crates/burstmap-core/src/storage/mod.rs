// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Byte-oriented object storage used for call status, output and init markers.
//!
//! Objects of a call live under `{executor_id}/{job_id}/{call_id}/{kind}`
//! where `kind` is one of `status`, `output` or `init`.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use thiserror::Error;

use crate::job::CallKey;

/// Errors from storage operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Object storage collaborator.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `body` under `key`, replacing any previous object.
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;

    /// Fetch the object stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the object under `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every key starting with `prefix`, in lexical order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Kind of per-call object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Marker written when the worker starts the call.
    Init,
    /// Status document written when the call finishes.
    Status,
    /// Output document of a successful call.
    Output,
}

impl ObjectKind {
    /// Key suffix of this object kind.
    pub fn suffix(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Status => "status",
            Self::Output => "output",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "init" => Some(Self::Init),
            "status" => Some(Self::Status),
            "output" => Some(Self::Output),
            _ => None,
        }
    }
}

/// Storage key of an object belonging to `call`.
pub fn object_key(call: &CallKey, kind: ObjectKind) -> String {
    format!(
        "{}/{}/{}/{}",
        call.executor_id,
        call.job_id,
        call.call_id,
        kind.suffix()
    )
}

/// Storage key of the status document of `call`.
pub fn status_key(call: &CallKey) -> String {
    object_key(call, ObjectKind::Status)
}

/// Storage key of the output document of `call`.
pub fn output_key(call: &CallKey) -> String {
    object_key(call, ObjectKind::Output)
}

/// Storage key of the init marker of `call`.
pub fn init_key(call: &CallKey) -> String {
    object_key(call, ObjectKind::Init)
}

/// Split a per-call storage key into the call identity and object kind.
///
/// Returns `None` for keys that do not follow the per-call layout.
pub fn parse_key(key: &str) -> Option<(CallKey, ObjectKind)> {
    let mut parts = key.split('/');
    let executor_id = parts.next()?;
    let job_id = parts.next()?;
    let call_id = parts.next()?;
    let kind = ObjectKind::from_suffix(parts.next()?)?;
    if parts.next().is_some() || executor_id.is_empty() || job_id.is_empty() || call_id.is_empty()
    {
        return None;
    }
    Some((CallKey::new(executor_id, job_id, call_id), kind))
}
