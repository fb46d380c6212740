//! In-Memory Change Feed
//!
//! A `ChangeFeed` that lives entirely in-process. Rows published here are
//! matched against every active channel's bindings (table, change kind and
//! row filter) and fanned out to the channels that accept them, in publish
//! order.
//!
//! Backs mock mode (fed by the synthetic generator) and the test suite.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::application::ports::{
    ChangeFeed, ChangeNotification, ChangeStream, ChannelId, ChannelRequest, FeedError,
};
use crate::domain::records::{ChangeKind, Table};
use crate::infrastructure::config::DEFAULT_CHANNEL_CAPACITY;

struct MemoryChannel {
    request: ChannelRequest,
    tx: mpsc::Sender<ChangeNotification>,
}

/// Summary of one active channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    /// Channel identifier.
    pub id: ChannelId,
    /// Channel name.
    pub name: String,
}

/// In-process change feed with local filter evaluation.
///
/// # Example
///
/// ```rust
/// use dashboard_feed::infrastructure::memory::InMemoryChangeFeed;
///
/// let feed = InMemoryChangeFeed::with_defaults();
/// assert_eq!(feed.channel_count(), 0);
/// ```
pub struct InMemoryChangeFeed {
    channels: RwLock<HashMap<ChannelId, MemoryChannel>>,
    capacity: usize,
    fail_next_subscribe: Mutex<Option<String>>,
}

impl InMemoryChangeFeed {
    /// Create a feed buffering up to `capacity` notifications per channel.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            fail_next_subscribe: Mutex::new(None),
        }
    }

    /// Create a feed with the default per-channel capacity.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Make the next `subscribe` call fail with `reason`.
    pub fn fail_next_subscribe(&self, reason: impl Into<String>) {
        *self.fail_next_subscribe.lock() = Some(reason.into());
    }

    /// Deliver a notification to every channel that accepts it.
    ///
    /// Returns the number of channels it was delivered to. Waits while a
    /// channel's buffer is full.
    pub async fn publish(&self, notification: ChangeNotification) -> usize {
        let targets: Vec<_> = self
            .channels
            .read()
            .values()
            .filter(|c| c.request.accepts(&notification))
            .map(|c| (c.request.id, c.tx.clone()))
            .collect();

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(notification.clone()).await.is_ok() {
                delivered += 1;
            } else {
                tracing::debug!(channel_id = id, "Receiver gone, skipping channel");
            }
        }

        delivered
    }

    /// Publish an inserted row.
    pub async fn insert(&self, table: Table, record: Value) -> usize {
        self.publish(
            ChangeNotification::new(table, ChangeKind::Insert, record)
                .with_commit_timestamp(Utc::now()),
        )
        .await
    }

    /// Publish an updated row.
    pub async fn update(&self, table: Table, record: Value) -> usize {
        self.publish(
            ChangeNotification::new(table, ChangeKind::Update, record)
                .with_commit_timestamp(Utc::now()),
        )
        .await
    }

    /// Number of active channels.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Active channels, sorted by id.
    #[must_use]
    pub fn active_channels(&self) -> Vec<ChannelSummary> {
        let mut channels: Vec<_> = self
            .channels
            .read()
            .values()
            .map(|c| ChannelSummary {
                id: c.request.id,
                name: c.request.name.clone(),
            })
            .collect();
        channels.sort_by_key(|c| c.id);
        channels
    }
}

impl Default for InMemoryChangeFeed {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for InMemoryChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryChangeFeed")
            .field("channels", &self.channel_count())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self, request: ChannelRequest) -> Result<ChangeStream, FeedError> {
        if let Some(reason) = self.fail_next_subscribe.lock().take() {
            return Err(FeedError::JoinRejected {
                channel: request.name,
                reason,
            });
        }

        let mut channels = self.channels.write();
        if channels.contains_key(&request.id) {
            return Err(FeedError::ChannelExists(request.id));
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        tracing::debug!(channel = %request.name, id = request.id, "Memory channel joined");
        channels.insert(request.id, MemoryChannel { request, tx });

        Ok(rx)
    }

    async fn remove_channel(&self, id: ChannelId) -> Result<(), FeedError> {
        self.channels
            .write()
            .remove(&id)
            .map(|c| tracing::debug!(channel = %c.request.name, id, "Memory channel removed"))
            .ok_or(FeedError::UnknownChannel(id))
    }
}
