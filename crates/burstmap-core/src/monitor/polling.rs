// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage scanning.
//!
//! The polling strategy derives events from the job namespace: an init marker
//! means the call started, a status document means it ended. The push strategy
//! uses the same scan once per namespace to catch up on events published
//! before it subscribed.

use tracing::warn;

use crate::error::Result;
use crate::job::JobKey;
use crate::status::CallStatus;
use crate::storage::{self, ObjectKind, Storage};

use super::tracker::JobTracker;

/// List `job`'s namespace and feed new init/end observations to `tracker`.
pub(super) async fn scan_namespace(
    storage: &dyn Storage,
    tracker: &mut JobTracker,
    job: &JobKey,
) -> Result<()> {
    let prefix = format!("{}/", job.namespace());
    let keys = storage.list_keys(&prefix).await?;

    for key in keys {
        let Some((call, kind)) = storage::parse_key(&key) else {
            continue;
        };
        match kind {
            ObjectKind::Init => tracker.on_init(&call),
            ObjectKind::Status => {
                if !tracker.awaits_end(&call) {
                    continue;
                }
                let status = match storage.get(&key).await? {
                    Some(body) => match CallStatus::decode(&body) {
                        Ok(status) => Some(status),
                        Err(e) => {
                            warn!(call = %call, error = %e, "Undecodable status document");
                            None
                        }
                    },
                    None => None,
                };
                tracker.on_end(&call, status);
            }
            ObjectKind::Output => {}
        }
    }
    Ok(())
}
