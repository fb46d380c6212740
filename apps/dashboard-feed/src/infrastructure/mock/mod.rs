//! Synthetic Data Generator
//!
//! Drives mock mode: on every tick it publishes a small batch of `events`
//! and `trades` rows for one stream into an [`InMemoryChangeFeed`], so the
//! router can be exercised without a live backend.
//!
//! Trades are inserted as `pending` and filled on a later tick through an
//! `UPDATE`, which gives trade subscribers both change kinds.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::application::ports::ChangeNotification;
use crate::domain::records::{ChangeKind, EventKind, StreamId, Table};
use crate::infrastructure::config::MockSettings;
use crate::infrastructure::memory::InMemoryChangeFeed;

const SYMBOLS: &[&str] = &["AAPL", "MSFT", "NVDA", "SPY", "QQQ"];
const ACTIONS: &[&str] = &["BUY", "SELL", "HOLD"];
const AUX_EVENT_TYPES: &[&str] = &["signal", "heartbeat", "risk_check"];

/// Trades left unfilled before the oldest is forced through.
const MAX_PENDING_TRADES: usize = 8;

/// Shortest tick the generator runs at; `tokio::time::interval` rejects zero.
pub const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Publishes synthetic rows for one stream until cancelled.
pub struct SyntheticGenerator {
    feed: Arc<InMemoryChangeFeed>,
    stream: StreamId,
    settings: MockSettings,
    cancel: CancellationToken,
    rng: StdRng,
    next_id: i64,
    pending: Vec<Value>,
}

impl SyntheticGenerator {
    /// Create a generator seeded from the OS.
    ///
    /// Tick intervals below [`MIN_TICK_INTERVAL`] are raised to it.
    #[must_use]
    pub fn new(
        feed: Arc<InMemoryChangeFeed>,
        stream: StreamId,
        settings: MockSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_rng(feed, stream, settings, cancel, StdRng::from_os_rng())
    }

    /// Create a generator with a fixed seed.
    #[must_use]
    pub fn seeded(
        feed: Arc<InMemoryChangeFeed>,
        stream: StreamId,
        settings: MockSettings,
        cancel: CancellationToken,
        seed: u64,
    ) -> Self {
        Self::with_rng(feed, stream, settings, cancel, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        feed: Arc<InMemoryChangeFeed>,
        stream: StreamId,
        mut settings: MockSettings,
        cancel: CancellationToken,
        rng: StdRng,
    ) -> Self {
        settings.tick_interval = settings.tick_interval.max(MIN_TICK_INTERVAL);
        Self {
            feed,
            stream,
            settings,
            cancel,
            rng,
            next_id: 1,
            pending: Vec::new(),
        }
    }

    /// Stream the generator writes to.
    #[must_use]
    pub const fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Build the next batch of notifications without publishing it.
    pub fn next_batch(&mut self) -> Vec<ChangeNotification> {
        let mut batch = vec![self.next_event()];

        if self.rng.random_bool(0.4) || self.pending.len() >= MAX_PENDING_TRADES {
            if let Some(fill) = self.fill_pending() {
                batch.push(fill);
            }
        }

        if self.rng.random_bool(0.5) {
            batch.push(self.new_trade());
        }

        batch
    }

    /// Publish a batch every tick until cancelled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        tracing::info!(
            stream = %self.stream,
            tick_ms = self.settings.tick_interval.as_millis(),
            "Synthetic generator started"
        );

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for notification in self.next_batch() {
                        let delivered = self.feed.publish(notification).await;
                        tracing::trace!(delivered, "Synthetic row published");
                    }
                }
            }
        }

        tracing::info!(stream = %self.stream, "Synthetic generator stopped");
    }

    // =========================================================================
    // Row builders
    // =========================================================================

    fn allocate_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn next_event(&mut self) -> ChangeNotification {
        let id = self.allocate_id();
        let symbol = self.pick(SYMBOLS);
        let roll: f64 = self.rng.random();

        let record = if roll < 0.4 {
            json!({
                "id": id,
                "session_id": self.stream.as_str(),
                "event_type": EventKind::DECISION,
                "created_at": Utc::now().to_rfc3339(),
                "symbol": symbol,
                "action": self.pick(ACTIONS),
                "confidence": self.rng.random_range(50..=99),
            })
        } else if roll < 0.75 {
            json!({
                "id": id,
                "session_id": self.stream.as_str(),
                "event_type": EventKind::BELIEF,
                "created_at": Utc::now().to_rfc3339(),
                "symbol": symbol,
                "probability": self.rng.random_range(0..=100),
            })
        } else {
            json!({
                "id": id,
                "session_id": self.stream.as_str(),
                "event_type": self.pick(AUX_EVENT_TYPES),
                "created_at": Utc::now().to_rfc3339(),
            })
        };

        ChangeNotification::new(Table::Events, ChangeKind::Insert, record)
            .with_commit_timestamp(Utc::now())
    }

    fn new_trade(&mut self) -> ChangeNotification {
        let id = self.allocate_id();
        let price = Decimal::new(self.rng.random_range(5_000..=60_000), 2);
        let quantity = Decimal::from(self.rng.random_range(1..=100));
        let side = if self.rng.random_bool(0.5) { "buy" } else { "sell" };

        let record = json!({
            "id": id,
            "session_id": self.stream.as_str(),
            "symbol": self.pick(SYMBOLS),
            "side": side,
            "price": price,
            "quantity": quantity,
            "status": "pending",
        });
        self.pending.push(record.clone());

        ChangeNotification::new(Table::Trades, ChangeKind::Insert, record)
            .with_commit_timestamp(Utc::now())
    }

    fn fill_pending(&mut self) -> Option<ChangeNotification> {
        if self.pending.is_empty() {
            return None;
        }
        let mut record = self.pending.remove(0);
        if let Some(row) = record.as_object_mut() {
            row.insert("status".to_string(), json!("filled"));
            row.insert("executed_at".to_string(), json!(Utc::now().to_rfc3339()));
        }

        Some(
            ChangeNotification::new(Table::Trades, ChangeKind::Update, record)
                .with_commit_timestamp(Utc::now()),
        )
    }

    fn pick(&mut self, options: &[&'static str]) -> &'static str {
        options.choose(&mut self.rng).copied().unwrap_or_default()
    }
}

impl std::fmt::Debug for SyntheticGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticGenerator")
            .field("stream", &self.stream)
            .field("tick_interval", &self.settings.tick_interval)
            .field("pending_trades", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::records::{FeedEvent, TradeRecord};

    fn generator(seed: u64) -> SyntheticGenerator {
        SyntheticGenerator::seeded(
            Arc::new(InMemoryChangeFeed::with_defaults()),
            StreamId::new("mock-stream"),
            MockSettings {
                tick_interval: Duration::from_millis(5),
            },
            CancellationToken::new(),
            seed,
        )
    }

    #[test]
    fn every_row_decodes_and_belongs_to_stream() {
        let mut generator = generator(7);

        for _ in 0..200 {
            for notification in generator.next_batch() {
                match notification.table.as_str() {
                    "events" => {
                        let event = FeedEvent::decode(notification.record).unwrap();
                        assert_eq!(event.record().session_id.as_str(), "mock-stream");
                    }
                    "trades" => {
                        let trade = TradeRecord::decode(notification.record).unwrap();
                        assert_eq!(trade.session_id.as_str(), "mock-stream");
                        assert!(trade.price.is_some());
                    }
                    other => panic!("unexpected table {other}"),
                }
            }
        }
    }

    #[test]
    fn produces_every_event_class() {
        let mut generator = generator(11);
        let mut seen = (false, false, false);

        for _ in 0..200 {
            for n in generator.next_batch() {
                if n.table != "events" {
                    continue;
                }
                match FeedEvent::decode(n.record).unwrap() {
                    FeedEvent::Decision(_) => seen.0 = true,
                    FeedEvent::Belief(_) => seen.1 = true,
                    FeedEvent::Generic(_) => seen.2 = true,
                }
            }
        }

        assert_eq!(seen, (true, true, true));
    }

    #[test]
    fn fills_follow_inserts() {
        let mut generator = generator(3);
        let mut inserted = std::collections::HashSet::new();

        for _ in 0..200 {
            for n in generator.next_batch() {
                if n.table != "trades" {
                    continue;
                }
                let id = n.record["id"].as_i64().unwrap();
                match n.kind {
                    ChangeKind::Insert => {
                        assert_eq!(n.record["status"], "pending");
                        inserted.insert(id);
                    }
                    ChangeKind::Update => {
                        assert_eq!(n.record["status"], "filled");
                        assert!(inserted.remove(&id));
                    }
                    ChangeKind::Delete => panic!("generator never deletes"),
                }
            }
        }
    }

    #[test]
    fn same_seed_same_rows() {
        let rows = |seed| {
            let mut generator = generator(seed);
            (0..20)
                .flat_map(|_| generator.next_batch())
                .map(|n| n.record["event_type"].clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(rows(42), rows(42));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let generator = generator(1);
        let cancel = generator.cancel.clone();
        let task = tokio::spawn(generator.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn zero_tick_is_raised_to_minimum() {
        let feed = Arc::new(InMemoryChangeFeed::with_defaults());
        let cancel = CancellationToken::new();
        let generator = SyntheticGenerator::new(
            feed,
            StreamId::new("mock-stream"),
            MockSettings {
                tick_interval: Duration::ZERO,
            },
            cancel.clone(),
        );
        assert_eq!(generator.settings.tick_interval, MIN_TICK_INTERVAL);

        let task = tokio::spawn(generator.run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
