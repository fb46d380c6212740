//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `RealtimeRouter`: opens event and trade subscriptions, routes rows to
//!   callbacks, releases channels
//! - `SubscriptionHandle`: caller-owned reference to one open channel

mod handle;
mod router;

pub use handle::{ChannelStatus, SubscriptionError, SubscriptionHandle};
pub use router::{EVENTS_NAMESPACE, RealtimeRouter, STREAM_COLUMN, TRADES_NAMESPACE};
