//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ChangeFeed`: the backend's change-notification service. Only four
//!   capabilities are used: naming a channel, registering change bindings
//!   on it, activating it, and releasing it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::domain::filter::Filter;
use crate::domain::records::{ChangeKind, Table};

/// Schema the dashboard tables live in.
pub const DEFAULT_SCHEMA: &str = "public";

/// Identifier allocated by the router for every channel it opens.
pub type ChannelId = u64;

/// Receiving end of an activated channel.
///
/// Ends (`recv` returns `None`) when the channel is released or the backend
/// drops it.
pub type ChangeStream = mpsc::Receiver<ChangeNotification>;

// =============================================================================
// Channel Description
// =============================================================================

/// Which change kinds a binding listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeSelector {
    /// Every change kind (`*`).
    All,
    /// A single change kind.
    Only(ChangeKind),
}

impl ChangeSelector {
    /// Wire value (`*`, `INSERT`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "*",
            Self::Only(kind) => kind.as_str(),
        }
    }

    /// Whether `kind` is selected.
    #[must_use]
    pub fn accepts(self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Only(selected) => selected == kind,
        }
    }
}

/// One `postgres_changes` registration on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeBinding {
    /// Change kinds to receive.
    pub selector: ChangeSelector,
    /// Database schema.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Optional server-side row filter.
    pub filter: Option<Filter>,
}

impl ChangeBinding {
    /// Listen to `selector` changes on `table` in the default schema.
    #[must_use]
    pub fn new(selector: ChangeSelector, table: Table) -> Self {
        Self {
            selector,
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.as_str().to_string(),
            filter: None,
        }
    }

    /// Narrow the binding with a row filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether a notification falls under this binding.
    #[must_use]
    pub fn accepts(&self, notification: &ChangeNotification) -> bool {
        self.schema == notification.schema
            && self.table == notification.table
            && self.selector.accepts(notification.kind)
            && self
                .filter
                .as_ref()
                .is_none_or(|f| f.matches(&notification.record))
    }
}

/// A named channel and its bindings, ready to be activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Router-allocated identifier, unique per router.
    pub id: ChannelId,
    /// Channel name (`<namespace>:<stream>`).
    pub name: String,
    /// Registered bindings.
    pub bindings: Vec<ChangeBinding>,
}

impl ChannelRequest {
    /// Name a new channel with no bindings yet.
    #[must_use]
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            bindings: Vec::new(),
        }
    }

    /// Register a binding.
    #[must_use]
    pub fn on(mut self, binding: ChangeBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Whether any binding accepts the notification.
    #[must_use]
    pub fn accepts(&self, notification: &ChangeNotification) -> bool {
        self.bindings.iter().any(|b| b.accepts(notification))
    }
}

/// A single row change pushed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    /// Database schema.
    pub schema: String,
    /// Table name.
    pub table: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Row after the change (before it, for deletes).
    pub record: Value,
    /// Commit time reported by the backend.
    pub commit_timestamp: Option<DateTime<Utc>>,
}

impl ChangeNotification {
    /// Notification for `table` in the default schema.
    #[must_use]
    pub fn new(table: Table, kind: ChangeKind, record: Value) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.as_str().to_string(),
            kind,
            record,
            commit_timestamp: None,
        }
    }

    /// Attach a commit timestamp.
    #[must_use]
    pub const fn with_commit_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.commit_timestamp = Some(ts);
        self
    }
}

// =============================================================================
// Change Feed Port
// =============================================================================

/// Errors reported by a change feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// No channel with this id is active.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// A channel with this id is already active.
    #[error("channel {0} already exists")]
    ChannelExists(ChannelId),

    /// Backend refused to join the channel.
    #[error("channel {channel} rejected: {reason}")]
    JoinRejected {
        /// Channel name.
        channel: String,
        /// Backend-provided reason.
        reason: String,
    },

    /// Backend did not answer the join in time.
    #[error("channel {0} join timed out")]
    JoinTimeout(String),

    /// The connection to the backend is gone.
    #[error("change feed disconnected")]
    Disconnected,

    /// Any other transport failure.
    #[error("change feed transport error: {0}")]
    Transport(String),
}

/// Backend change-notification service.
///
/// `subscribe` both registers the channel's bindings and activates it; the
/// returned stream yields matching notifications in backend order until the
/// channel is released with `remove_channel`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Activate a channel.
    async fn subscribe(&self, request: ChannelRequest) -> Result<ChangeStream, FeedError>;

    /// Release a channel and its backend resources.
    async fn remove_channel(&self, id: ChannelId) -> Result<(), FeedError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn events_binding() -> ChangeBinding {
        ChangeBinding::new(ChangeSelector::Only(ChangeKind::Insert), Table::Events)
            .with_filter(Filter::eq("session_id", "a"))
    }

    #[test]
    fn binding_matches_table_kind_and_filter() {
        let binding = events_binding();

        let hit = ChangeNotification::new(
            Table::Events,
            ChangeKind::Insert,
            json!({"session_id": "a"}),
        );
        assert!(binding.accepts(&hit));

        let wrong_stream = ChangeNotification::new(
            Table::Events,
            ChangeKind::Insert,
            json!({"session_id": "b"}),
        );
        assert!(!binding.accepts(&wrong_stream));

        let wrong_kind = ChangeNotification::new(
            Table::Events,
            ChangeKind::Update,
            json!({"session_id": "a"}),
        );
        assert!(!binding.accepts(&wrong_kind));

        let wrong_table = ChangeNotification::new(
            Table::Trades,
            ChangeKind::Insert,
            json!({"session_id": "a"}),
        );
        assert!(!binding.accepts(&wrong_table));
    }

    #[test]
    fn all_selector_accepts_every_kind() {
        let binding = ChangeBinding::new(ChangeSelector::All, Table::Trades);
        for kind in [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete] {
            let n = ChangeNotification::new(Table::Trades, kind, json!({}));
            assert!(binding.accepts(&n));
        }
        assert_eq!(ChangeSelector::All.as_str(), "*");
    }

    #[test]
    fn request_accepts_any_binding() {
        let request = ChannelRequest::new(1, "mixed:a")
            .on(events_binding())
            .on(ChangeBinding::new(ChangeSelector::All, Table::Trades));

        let trade = ChangeNotification::new(Table::Trades, ChangeKind::Update, json!({}));
        assert!(request.accepts(&trade));
        assert_eq!(request.bindings.len(), 2);
    }
}
