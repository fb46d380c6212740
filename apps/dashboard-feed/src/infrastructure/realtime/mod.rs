//! Supabase Realtime Adapter
//!
//! Live `ChangeFeed` speaking the Phoenix channels protocol over a single
//! WebSocket.
//!
//! - `messages`: frame envelope, join/leave/heartbeat builders, inbound decoding
//! - `client`: connection task and the `ChangeFeed` implementation

pub mod client;
pub mod messages;

pub use client::{RealtimeClient, RealtimeClientConfig, RealtimeError};
pub use messages::{FrameError, Inbound, PhoenixMessage, ReplyOutcome};
