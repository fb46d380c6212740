//! Realtime Router
//!
//! Opens change-feed channels scoped to one stream and routes every inbound
//! row to caller-supplied callbacks.
//!
//! # Channels
//!
//! | Router | Name              | Table    | Changes         | Filter               |
//! |--------|-------------------|----------|-----------------|----------------------|
//! | Event  | `events:<stream>` | `events` | `INSERT`        | `session_id=eq.<s>`  |
//! | Trade  | `trades:<stream>` | `trades` | `*` (ins + upd) | `session_id=eq.<s>`  |
//!
//! Every open call allocates a fresh channel, even for a stream that is
//! already subscribed. Channel ids come from one process-wide counter, so
//! any number of routers can share a feed. Activation runs on a spawned task; the open call
//! returns at once and the handle reports the outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::handle::{ChannelStatus, SubscriptionError, SubscriptionHandle};
use crate::application::ports::{
    ChangeBinding, ChangeFeed, ChangeNotification, ChangeSelector, ChannelId, ChannelRequest,
};
use crate::domain::filter::Filter;
use crate::domain::records::{ChangeKind, FeedEvent, StreamId, Table, TradeEvent, TradeRecord};
use crate::domain::routing::{EventCallbacks, HandlerClass, TradeHandler, dispatch_trade};
use crate::infrastructure::metrics;

/// Column holding the stream identifier on both tables.
pub const STREAM_COLUMN: &str = "session_id";

/// Channel name namespace for event subscriptions.
pub const EVENTS_NAMESPACE: &str = "events";

/// Channel name namespace for trade subscriptions.
pub const TRADES_NAMESPACE: &str = "trades";

/// Feeds key channels by id; ids must not repeat across routers.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

fn allocate_channel_id() -> ChannelId {
    NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where the rows of one channel go.
enum RecordSink {
    Events(EventCallbacks),
    Trades(TradeHandler),
}

impl RecordSink {
    const fn table(&self) -> Table {
        match self {
            Self::Events(_) => Table::Events,
            Self::Trades(_) => Table::Trades,
        }
    }

    fn deliver(&self, channel: &str, notification: ChangeNotification) {
        let table = self.table();
        metrics::record_received(table);

        match self {
            Self::Events(callbacks) => {
                let event = match FeedEvent::decode(notification.record) {
                    Ok(event) => event,
                    Err(e) => {
                        metrics::record_undecodable(table);
                        tracing::warn!(channel, error = %e, "Skipping undecodable event row");
                        return;
                    }
                };

                let dispatched = callbacks.dispatch(&event);
                if dispatched.generic {
                    metrics::record_dispatch(HandlerClass::Generic);
                }
                if let Some(class) = dispatched.specialized {
                    metrics::record_dispatch(class);
                }
                tracing::trace!(
                    channel,
                    event_type = event.record().event_type_str(),
                    handlers = dispatched.count(),
                    "Event dispatched"
                );
            }
            Self::Trades(handler) => {
                let trade = match TradeRecord::decode(notification.record) {
                    Ok(trade) => trade,
                    Err(e) => {
                        metrics::record_undecodable(table);
                        tracing::warn!(channel, error = %e, "Skipping undecodable trade row");
                        return;
                    }
                };

                dispatch_trade(
                    handler,
                    &TradeEvent {
                        change: notification.kind,
                        trade,
                    },
                );
                metrics::record_dispatch(HandlerClass::Trade);
            }
        }
    }
}

/// Opens, routes and releases change-feed subscriptions.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use dashboard_feed::application::services::RealtimeRouter;
/// use dashboard_feed::domain::routing::EventCallbacks;
/// use dashboard_feed::infrastructure::memory::InMemoryChangeFeed;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let feed = Arc::new(InMemoryChangeFeed::with_defaults());
/// let router = RealtimeRouter::new(feed, "default".into());
///
/// let handle = router.open_event_subscription(
///     Some("btc-usd".into()),
///     EventCallbacks::new().on_decision(|r| println!("{:?}", r.fields)),
/// );
/// handle.activated().await.unwrap();
///
/// router.close_subscription(&handle).await.unwrap();
/// assert!(router.close_subscription(&handle).await.is_err());
/// # }
/// ```
pub struct RealtimeRouter {
    feed: Arc<dyn ChangeFeed>,
    default_stream: StreamId,
}

impl RealtimeRouter {
    /// Create a router over `feed`; `default_stream` is used when an open
    /// call names no stream.
    #[must_use]
    pub fn new(feed: Arc<dyn ChangeFeed>, default_stream: StreamId) -> Self {
        Self {
            feed,
            default_stream,
        }
    }

    /// Stream used when none is given.
    #[must_use]
    pub const fn default_stream(&self) -> &StreamId {
        &self.default_stream
    }

    /// Subscribe to new `events` rows of one stream.
    ///
    /// Each row reaches `on_event` (if set) and then the decision or belief
    /// handler matching its `event_type` (if set). Must be called inside a
    /// Tokio runtime.
    #[must_use = "the subscription must be released with close_subscription"]
    pub fn open_event_subscription(
        &self,
        stream: Option<StreamId>,
        callbacks: EventCallbacks,
    ) -> SubscriptionHandle {
        self.open(
            stream,
            EVENTS_NAMESPACE,
            ChangeSelector::Only(ChangeKind::Insert),
            RecordSink::Events(callbacks),
        )
    }

    /// Subscribe to inserted and updated `trades` rows of one stream.
    ///
    /// Every row is forwarded to `on_trade`. Must be called inside a Tokio
    /// runtime.
    #[must_use = "the subscription must be released with close_subscription"]
    pub fn open_trade_subscription(
        &self,
        stream: Option<StreamId>,
        on_trade: TradeHandler,
    ) -> SubscriptionHandle {
        self.open(
            stream,
            TRADES_NAMESPACE,
            ChangeSelector::All,
            RecordSink::Trades(on_trade),
        )
    }

    /// Release a subscription.
    ///
    /// Stops local dispatch, then releases the backend channel if it is
    /// still joined. Channels that never activated, or that the backend
    /// already ended, are closed locally without a backend call.
    ///
    /// # Errors
    ///
    /// - `AlreadyClosed` on every call after the first for the same handle.
    /// - `Release` if the backend fails to release the channel.
    pub async fn close_subscription(
        &self,
        handle: &SubscriptionHandle,
    ) -> Result<(), SubscriptionError> {
        if !handle.begin_close() {
            return Err(SubscriptionError::AlreadyClosed {
                channel: handle.name().to_string(),
            });
        }

        handle.stop_dispatch().await;

        let status = handle.status();
        handle.set_status(ChannelStatus::Closed);

        match status {
            ChannelStatus::Active => {}
            ChannelStatus::Ended => {
                tracing::debug!(channel = handle.name(), "Closed subscription the backend ended");
                return Ok(());
            }
            _ => {
                tracing::debug!(channel = handle.name(), "Closed subscription that never activated");
                return Ok(());
            }
        }

        self.feed.remove_channel(handle.id()).await.map_err(|source| {
            metrics::record_release_failure(handle.table());
            tracing::warn!(channel = handle.name(), error = %source, "Channel release failed");
            SubscriptionError::Release {
                channel: handle.name().to_string(),
                source,
            }
        })?;

        metrics::record_channel_closed(handle.table());
        tracing::info!(channel = handle.name(), "Subscription closed");
        Ok(())
    }

    fn open(
        &self,
        stream: Option<StreamId>,
        namespace: &str,
        selector: ChangeSelector,
        sink: RecordSink,
    ) -> SubscriptionHandle {
        let stream = stream.unwrap_or_else(|| self.default_stream.clone());
        let id = allocate_channel_id();
        let name = format!("{namespace}:{stream}");
        let table = sink.table();

        let request = ChannelRequest::new(id, name.clone()).on(
            ChangeBinding::new(selector, table)
                .with_filter(Filter::eq(STREAM_COLUMN, stream.as_str())),
        );

        let status_tx = Arc::new(watch::Sender::new(ChannelStatus::Pending));
        let cancel = CancellationToken::new();

        tracing::debug!(channel = %name, id, "Opening subscription");

        let task = tokio::spawn(run_channel(
            Arc::clone(&self.feed),
            request,
            sink,
            Arc::clone(&status_tx),
            cancel.clone(),
        ));

        SubscriptionHandle::new(id, name, stream, table, status_tx, cancel, task)
    }
}

impl std::fmt::Debug for RealtimeRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeRouter")
            .field("default_stream", &self.default_stream)
            .finish_non_exhaustive()
    }
}

/// Activate one channel and drain it until cancelled or ended.
async fn run_channel(
    feed: Arc<dyn ChangeFeed>,
    request: ChannelRequest,
    sink: RecordSink,
    status: Arc<watch::Sender<ChannelStatus>>,
    cancel: CancellationToken,
) {
    let channel = request.name.clone();
    let table = sink.table();

    let mut stream = match feed.subscribe(request).await {
        Ok(stream) => {
            status.send_replace(ChannelStatus::Active);
            metrics::record_channel_opened(table);
            tracing::info!(channel = %channel, "Subscription active");
            stream
        }
        Err(e) => {
            tracing::warn!(channel = %channel, error = %e, "Subscription failed to activate");
            status.send_replace(ChannelStatus::Failed(e.to_string()));
            return;
        }
    };

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(channel = %channel, "Dispatch cancelled");
                return;
            }
            notification = stream.recv() => {
                let Some(notification) = notification else {
                    tracing::info!(channel = %channel, "Change stream ended by backend");
                    status.send_replace(ChannelStatus::Ended);
                    return;
                };
                sink.deliver(&channel, notification);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::application::ports::{ChangeStream, FeedError, MockChangeFeed};
    use crate::domain::routing::trade_handler;

    /// Senders behind the streams a mock feed handed out; holding them keeps
    /// the streams open.
    type HeldSenders = Arc<Mutex<Vec<mpsc::Sender<ChangeNotification>>>>;

    fn open_stream(held: &HeldSenders) -> ChangeStream {
        let (tx, rx) = mpsc::channel(1);
        held.lock().push(tx);
        rx
    }

    #[tokio::test]
    async fn event_channel_request_shape() {
        let captured = Arc::new(Mutex::new(None));
        let captured_in = Arc::clone(&captured);
        let held = HeldSenders::default();
        let held_in = Arc::clone(&held);

        let mut feed = MockChangeFeed::new();
        feed.expect_subscribe().returning(move |request| {
            *captured_in.lock() = Some(request);
            Ok(open_stream(&held_in))
        });
        feed.expect_remove_channel().times(1).returning(|_| Ok(()));

        let router = RealtimeRouter::new(Arc::new(feed), "fallback".into());
        let handle = router.open_event_subscription(Some("eth-usd".into()), EventCallbacks::new());
        handle.activated().await.unwrap();

        let request = captured.lock().take().unwrap();
        assert_eq!(request.id, handle.id());
        assert_eq!(request.name, "events:eth-usd");
        assert_eq!(request.bindings.len(), 1);
        let binding = &request.bindings[0];
        assert_eq!(binding.table, "events");
        assert_eq!(binding.selector, ChangeSelector::Only(ChangeKind::Insert));
        assert_eq!(
            binding.filter.as_ref().unwrap().to_string(),
            "session_id=eq.eth-usd"
        );

        router.close_subscription(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn trade_channel_uses_default_stream_and_all_changes() {
        let captured = Arc::new(Mutex::new(None));
        let captured_in = Arc::clone(&captured);
        let held = HeldSenders::default();
        let held_in = Arc::clone(&held);

        let mut feed = MockChangeFeed::new();
        feed.expect_subscribe().returning(move |request| {
            *captured_in.lock() = Some(request);
            Ok(open_stream(&held_in))
        });
        feed.expect_remove_channel().times(1).returning(|_| Ok(()));

        let router = RealtimeRouter::new(Arc::new(feed), "fallback".into());
        let handle = router.open_trade_subscription(None, trade_handler(|_| {}));
        handle.activated().await.unwrap();

        let request = captured.lock().take().unwrap();
        assert_eq!(request.name, "trades:fallback");
        assert_eq!(request.bindings[0].table, "trades");
        assert_eq!(request.bindings[0].selector, ChangeSelector::All);
        assert_eq!(handle.stream().as_str(), "fallback");

        router.close_subscription(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn activation_failure_is_reported_and_close_skips_backend() {
        let mut feed = MockChangeFeed::new();
        feed.expect_subscribe()
            .returning(|request| Err(FeedError::JoinTimeout(request.name)));
        feed.expect_remove_channel().never();

        let router = RealtimeRouter::new(Arc::new(feed), "s".into());
        let handle = router.open_event_subscription(None, EventCallbacks::new());

        let err = handle.activated().await.unwrap_err();
        assert!(matches!(err, SubscriptionError::Activation { .. }));
        assert!(matches!(handle.status(), ChannelStatus::Failed(_)));

        router.close_subscription(&handle).await.unwrap();
        assert_eq!(handle.status(), ChannelStatus::Closed);
    }

    #[tokio::test]
    async fn release_failure_is_surfaced() {
        let held = HeldSenders::default();
        let held_in = Arc::clone(&held);

        let mut feed = MockChangeFeed::new();
        feed.expect_subscribe()
            .returning(move |_| Ok(open_stream(&held_in)));
        feed.expect_remove_channel()
            .returning(|_| Err(FeedError::Transport("socket write failed".to_string())));

        let router = RealtimeRouter::new(Arc::new(feed), "s".into());
        let handle = router.open_trade_subscription(None, trade_handler(|_| {}));
        handle.activated().await.unwrap();

        let err = router.close_subscription(&handle).await.unwrap_err();
        assert!(matches!(
            err,
            SubscriptionError::Release {
                source: FeedError::Transport(_),
                ..
            }
        ));

        // The handle is spent even though the backend refused.
        assert!(handle.is_closed());
        assert!(matches!(
            router.close_subscription(&handle).await,
            Err(SubscriptionError::AlreadyClosed { .. })
        ));
    }

    #[tokio::test]
    async fn ended_stream_closes_without_backend_release() {
        let mut feed = MockChangeFeed::new();
        // The sender drops with the closure, so the stream ends at once.
        feed.expect_subscribe().returning(|_| {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        });
        feed.expect_remove_channel().never();

        let router = RealtimeRouter::new(Arc::new(feed), "s".into());
        let handle = router.open_event_subscription(None, EventCallbacks::new());
        handle.activated().await.unwrap();

        timeout(Duration::from_secs(1), async {
            while handle.status() != ChannelStatus::Ended {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        router.close_subscription(&handle).await.unwrap();
        assert_eq!(handle.status(), ChannelStatus::Closed);
    }

    #[tokio::test]
    async fn channel_ids_are_unique_per_call() {
        let held = HeldSenders::default();
        let held_in = Arc::clone(&held);

        let mut feed = MockChangeFeed::new();
        feed.expect_subscribe()
            .returning(move |_| Ok(open_stream(&held_in)));
        feed.expect_remove_channel().times(2).returning(|_| Ok(()));

        let router = RealtimeRouter::new(Arc::new(feed), "s".into());
        let a = router.open_event_subscription(None, EventCallbacks::new());
        let b = router.open_event_subscription(None, EventCallbacks::new());

        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), b.name());

        for handle in [&a, &b] {
            timeout(Duration::from_secs(1), handle.activated())
                .await
                .unwrap()
                .unwrap();
            router.close_subscription(handle).await.unwrap();
        }
    }

    #[test]
    fn channel_id_allocation_is_monotonic() {
        let first = allocate_channel_id();
        let second = allocate_channel_id();
        assert!(second > first);
    }
}
