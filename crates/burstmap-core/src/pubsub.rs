// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Push-notification collaborator used by the push monitoring strategy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

/// Errors from pub/sub operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PubSubError {
    /// The topic could not be subscribed to.
    #[error("Subscribe to {topic} failed: {reason}")]
    Subscribe {
        /// Topic name.
        topic: String,
        /// Failure reason.
        reason: String,
    },

    /// The message could not be published.
    #[error("Publish to {topic} failed: {reason}")]
    Publish {
        /// Topic name.
        topic: String,
        /// Failure reason.
        reason: String,
    },
}

/// Topic-based message bus.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `message` to every current subscriber of `topic`.
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<(), PubSubError>;

    /// Subscribe to `topic`. Dropping the stream unsubscribes.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Vec<u8>>, PubSubError>;
}

/// In-process bus built on tokio broadcast channels, one channel per topic.
#[derive(Clone)]
pub struct LocalPubSub {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
    capacity: usize,
}

impl Default for LocalPubSub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl LocalPubSub {
    /// Create a bus whose topics buffer up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscribers of `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<Vec<u8>>>> {
        // The map is never left half-updated, so a poisoned lock is still usable
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PubSub for LocalPubSub {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<(), PubSubError> {
        let mut topics = self.lock();
        if let Some(tx) = topics.get(topic) {
            if tx.send(message).is_err() {
                // Last subscriber went away
                topics.remove(topic);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Vec<u8>>, PubSubError> {
        let rx = self
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let topic = topic.to_string();
        let stream = stream::unfold(rx, move |mut rx| {
            let topic = topic.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(msg) => return Some((msg, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic, skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}
