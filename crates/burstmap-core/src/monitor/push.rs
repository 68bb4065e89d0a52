// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Topic subscriptions of the push strategy.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{BoxStream, SelectAll};
use tracing::debug;

use crate::error::Result;
use crate::job::JobKey;
use crate::pubsub::PubSub;

/// Merged subscriptions to the topics of every job a watch covers.
///
/// Dropping this unsubscribes from all topics.
pub(super) struct Subscriptions {
    pubsub: Arc<dyn PubSub>,
    topics: HashSet<String>,
    streams: SelectAll<BoxStream<'static, Vec<u8>>>,
}

impl Subscriptions {
    pub(super) fn new(pubsub: Arc<dyn PubSub>) -> Self {
        Self {
            pubsub,
            topics: HashSet::new(),
            streams: SelectAll::new(),
        }
    }

    /// Subscribe to `job`'s topic. Returns false if already subscribed.
    pub(super) async fn add(&mut self, job: &JobKey) -> Result<bool> {
        let topic = job.topic();
        if self.topics.contains(&topic) {
            return Ok(false);
        }
        let stream = self.pubsub.subscribe(&topic).await?;
        debug!(topic = %topic, "Subscribed to job topic");
        self.streams.push(stream);
        self.topics.insert(topic);
        Ok(true)
    }

    /// Whether any subscription is live.
    pub(super) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Next message from any subscribed topic.
    pub(super) async fn next(&mut self) -> Option<Vec<u8>> {
        self.streams.next().await
    }
}
