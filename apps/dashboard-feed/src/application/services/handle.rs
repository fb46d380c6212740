//! Subscription Handles
//!
//! A handle is the caller's only reference to an open channel. It reports
//! activation progress and must be passed back to
//! [`RealtimeRouter::close_subscription`](super::RealtimeRouter::close_subscription)
//! to release the channel; nothing tracks handles on the caller's behalf.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{ChannelId, FeedError};
use crate::domain::records::{StreamId, Table};

/// Lifecycle of a channel as seen from its handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Activation requested, not yet confirmed.
    Pending,
    /// Backend confirmed the channel; records are flowing.
    Active,
    /// Activation failed; no records will arrive.
    Failed(String),
    /// The backend ended the stream without a local release.
    Ended,
    /// Released through the router.
    Closed,
}

/// Errors surfaced by subscription operations.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    /// The handle was already released.
    #[error("subscription {channel} is already closed")]
    AlreadyClosed {
        /// Channel name.
        channel: String,
    },

    /// The backend refused or never confirmed the channel.
    #[error("subscription {channel} failed to activate: {reason}")]
    Activation {
        /// Channel name.
        channel: String,
        /// Failure reported by the feed.
        reason: String,
    },

    /// The backend failed to release the channel.
    #[error("failed to release subscription {channel}: {source}")]
    Release {
        /// Channel name.
        channel: String,
        /// Underlying feed error.
        #[source]
        source: FeedError,
    },
}

/// Caller-owned reference to one open channel.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: ChannelId,
    name: String,
    stream: StreamId,
    table: Table,
    status_tx: Arc<watch::Sender<ChannelStatus>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SubscriptionHandle {
    pub(super) fn new(
        id: ChannelId,
        name: String,
        stream: StreamId,
        table: Table,
        status_tx: Arc<watch::Sender<ChannelStatus>>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            name,
            stream,
            table,
            status_tx,
            cancel,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }
    }

    /// Router-allocated channel identifier.
    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    /// Channel name (`<namespace>:<stream>`).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stream the channel is filtered to.
    #[must_use]
    pub const fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Table the channel listens to.
    #[must_use]
    pub const fn table(&self) -> Table {
        self.table
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.status_tx.borrow().clone()
    }

    /// Whether `close_subscription` has been called on this handle.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the backend confirms or rejects the channel.
    ///
    /// # Errors
    ///
    /// - `Activation` if the feed rejected the channel.
    /// - `AlreadyClosed` if the handle was released before activation settled.
    pub async fn activated(&self) -> Result<(), SubscriptionError> {
        let mut rx = self.status_tx.subscribe();
        let settled = rx
            .wait_for(|s| *s != ChannelStatus::Pending)
            .await
            .map(|s| s.clone())
            .unwrap_or(ChannelStatus::Closed);

        match settled {
            ChannelStatus::Active | ChannelStatus::Ended => Ok(()),
            ChannelStatus::Failed(reason) => Err(SubscriptionError::Activation {
                channel: self.name.clone(),
                reason,
            }),
            ChannelStatus::Pending | ChannelStatus::Closed => {
                Err(SubscriptionError::AlreadyClosed {
                    channel: self.name.clone(),
                })
            }
        }
    }

    /// Mark closed; returns `false` if it already was.
    pub(super) fn begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Stop local dispatch and wait for the dispatch task to finish.
    pub(super) async fn stop_dispatch(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(channel = %self.name, error = %e, "Dispatch task ended abnormally");
        }
    }

    pub(super) fn set_status(&self, status: ChannelStatus) {
        self.status_tx.send_replace(status);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            tracing::warn!(
                channel = %self.name,
                stream = %self.stream,
                "Subscription handle dropped without close; channel stays open"
            );
        }
    }
}
