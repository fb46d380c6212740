#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Dashboard Feed - Realtime Event Router
//!
//! Chooses where dashboard data comes from (synthetic or the live backend)
//! and turns the backend's row-change notifications into typed callbacks:
//! decisions, beliefs and generic events from the `events` table, inserts
//! and updates from the `trades` table, each scoped to one stream.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Records, filters and dispatch policy
//!   - `records`: Typed `events` / `trades` rows
//!   - `filter`: `<column>=eq.<value>` row filters
//!   - `routing`: Callback sets and who sees what
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: The `ChangeFeed` interface
//!   - `services`: `RealtimeRouter` and subscription handles
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `config`: Data-source mode and feed configuration
//!   - `memory`: In-process change feed
//!   - `mock`: Synthetic data generator
//!   - `realtime`: Supabase Realtime (Phoenix) client
//!   - `metrics` / `telemetry`: Observability
//!
//! # Data Flow
//!
//! ```text
//!  Supabase Realtime ──┐                        ┌──► on_event
//!                      ├──► ChangeFeed ──► Router ├──► on_decision / on_belief
//!  Synthetic generator ┘   (per channel)        └──► on_trade
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Records and routing policy with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::filter::{Filter, FilterError};
pub use domain::records::{
    ChangeKind, EventKind, EventRecord, FeedEvent, RecordId, StreamId, Table, TradeEvent,
    TradeRecord, TradeSide,
};
pub use domain::routing::{EventCallbacks, EventHandler, TradeHandler, trade_handler};

// Ports and services
pub use application::ports::{ChangeFeed, ChangeNotification, ChannelRequest, FeedError};
pub use application::services::{
    ChannelStatus, RealtimeRouter, SubscriptionError, SubscriptionHandle,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, Credentials, DataSourceMode, FeedConfig, MockSettings, SupabaseSettings,
};

// Feeds
pub use infrastructure::memory::InMemoryChangeFeed;
pub use infrastructure::mock::SyntheticGenerator;
pub use infrastructure::realtime::{RealtimeClient, RealtimeClientConfig, RealtimeError};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{
    TelemetryConfig, TelemetryError, TelemetryGuard, init as init_telemetry,
};
