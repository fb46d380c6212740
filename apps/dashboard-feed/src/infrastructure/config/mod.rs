//! Configuration Module
//!
//! Data source resolution and configuration loading for the feed.

mod settings;

pub use settings::{
    ConfigError, Credentials, DATA_SOURCE_VAR, DEFAULT_CHANNEL_CAPACITY, DEFAULT_METRICS_PORT,
    DEFAULT_STREAM, DataSourceMode, FeedConfig, LIVE_DATA_SOURCE, MockSettings, SupabaseSettings,
};
