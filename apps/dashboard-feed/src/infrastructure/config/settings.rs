//! Feed Configuration Settings
//!
//! Configuration types for the dashboard feed, loaded from environment
//! variables. The data source mode is resolved once when a `FeedConfig` is
//! built and cannot change afterwards; components receive the config value
//! rather than reading the environment themselves.

use std::time::Duration;

use crate::domain::records::StreamId;

/// Environment variable selecting the data source.
pub const DATA_SOURCE_VAR: &str = "DATA_SOURCE";

/// Value of [`DATA_SOURCE_VAR`] that selects the live backend.
pub const LIVE_DATA_SOURCE: &str = "supabase";

/// Where dashboard data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSourceMode {
    /// Synthetic, locally generated data.
    #[default]
    Mock,
    /// Live backend change feed.
    Live,
}

impl DataSourceMode {
    /// Resolve the mode from the raw environment value.
    ///
    /// Exactly `"supabase"` selects live data; anything else, including an
    /// unset or empty value, selects mock data.
    #[must_use]
    pub fn resolve(value: Option<&str>) -> Self {
        match value {
            Some(LIVE_DATA_SOURCE) => Self::Live,
            _ => Self::Mock,
        }
    }

    /// Check if this is mock mode.
    #[must_use]
    pub const fn is_mock(&self) -> bool {
        matches!(self, Self::Mock)
    }

    /// Check if this is live mode.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Live)
    }

    /// Get the mode name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Mock => "mock",
            Self::Live => LIVE_DATA_SOURCE,
        }
    }
}

/// Backend API credentials.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
}

impl Credentials {
    /// Create new credentials.
    #[must_use]
    pub const fn new(api_key: String) -> Self {
        Self { api_key }
    }

    /// Get the API key.
    #[must_use]
    pub fn api_key(&self) -> &str {
        &self.api_key
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

/// Live backend settings.
#[derive(Debug, Clone)]
pub struct SupabaseSettings {
    /// Project URL (`https://<project>.supabase.co`).
    pub url: String,
    /// Anonymous API key.
    pub credentials: Credentials,
    /// Interval between Phoenix heartbeats.
    pub heartbeat_interval: Duration,
    /// How long to wait for a channel join reply.
    pub join_timeout: Duration,
}

impl SupabaseSettings {
    /// Settings with default timings.
    #[must_use]
    pub const fn new(url: String, credentials: Credentials) -> Self {
        Self {
            url,
            credentials,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// Synthetic data settings.
#[derive(Debug, Clone)]
pub struct MockSettings {
    /// Interval between generated batches.
    pub tick_interval: Duration,
}

impl Default for MockSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(1_000),
        }
    }
}

/// Complete feed configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    mode: DataSourceMode,
    /// Stream used when a subscription names none.
    pub default_stream: StreamId,
    /// Buffered notifications per channel.
    pub channel_capacity: usize,
    /// Prometheus exporter port (0 = disabled).
    pub metrics_port: u16,
    /// Live backend settings; present whenever the mode is live.
    pub supabase: Option<SupabaseSettings>,
    /// Synthetic data settings.
    pub mock: MockSettings,
}

/// Default stream identifier.
pub const DEFAULT_STREAM: &str = "default";

/// Default per-channel buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Default Prometheus exporter port.
pub const DEFAULT_METRICS_PORT: u16 = 9091;

impl FeedConfig {
    /// Configuration for `mode` with every other setting at its default.
    ///
    /// Live mode built this way carries no backend settings; use
    /// [`FeedConfig::with_supabase`] or [`FeedConfig::from_env`].
    #[must_use]
    pub fn new(mode: DataSourceMode) -> Self {
        Self {
            mode,
            default_stream: StreamId::from(DEFAULT_STREAM),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            metrics_port: DEFAULT_METRICS_PORT,
            supabase: None,
            mock: MockSettings::default(),
        }
    }

    /// Attach live backend settings.
    #[must_use]
    pub fn with_supabase(mut self, settings: SupabaseSettings) -> Self {
        self.supabase = Some(settings);
        self
    }

    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if live mode is selected and the backend URL or key
    /// is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`FeedConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = DataSourceMode::resolve(lookup(DATA_SOURCE_VAR).as_deref());

        let mut config = Self::new(mode);

        if let Some(stream) = lookup("DASHBOARD_DEFAULT_STREAM").filter(|s| !s.is_empty()) {
            config.default_stream = StreamId::from(stream);
        }

        config.channel_capacity = parse_or(
            lookup("DASHBOARD_CHANNEL_CAPACITY"),
            DEFAULT_CHANNEL_CAPACITY,
        )
        .max(1);
        config.metrics_port = parse_or(lookup("DASHBOARD_METRICS_PORT"), DEFAULT_METRICS_PORT);

        config.mock = MockSettings {
            tick_interval: parse_duration(
                lookup("MOCK_TICK_MS"),
                MockSettings::default().tick_interval,
                Duration::from_millis,
            ),
        };

        if mode.is_live() {
            let url = required(&lookup, "SUPABASE_URL")?;
            let api_key = required(&lookup, "SUPABASE_ANON_KEY")?;

            let mut settings = SupabaseSettings::new(url, Credentials::new(api_key));
            settings.heartbeat_interval = parse_duration(
                lookup("SUPABASE_HEARTBEAT_SECS"),
                settings.heartbeat_interval,
                Duration::from_secs,
            );
            settings.join_timeout = parse_duration(
                lookup("SUPABASE_JOIN_TIMEOUT_SECS"),
                settings.join_timeout,
                Duration::from_secs,
            );

            config.supabase = Some(settings);
        }

        Ok(config)
    }

    /// The resolved data source mode.
    #[must_use]
    pub const fn mode(&self) -> DataSourceMode {
        self.mode
    }

    /// Check if mock data is selected.
    #[must_use]
    pub const fn is_mock(&self) -> bool {
        self.mode.is_mock()
    }

    /// Check if live data is selected.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.mode.is_live()
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn required<F>(lookup: &F, key: &str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
    if value.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(value)
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Zero and malformed values fall back to `default`.
fn parse_duration(value: Option<String>, default: Duration, unit: fn(u64) -> Duration) -> Duration {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|n| *n > 0)
        .map_or(default, unit)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn resolve_supabase_is_live() {
        let mode = DataSourceMode::resolve(Some("supabase"));
        assert_eq!(mode, DataSourceMode::Live);
        assert!(mode.is_live());
        assert!(!mode.is_mock());
    }

    #[test]
    fn resolve_defaults_to_mock() {
        for value in [None, Some(""), Some("mock"), Some("SUPABASE"), Some(" supabase")] {
            let mode = DataSourceMode::resolve(value);
            assert_eq!(mode, DataSourceMode::Mock, "value {value:?}");
            assert!(mode.is_mock());
            assert!(!mode.is_live());
        }
    }

    proptest! {
        #[test]
        fn resolve_anything_but_supabase_is_mock(value in ".*") {
            prop_assume!(value != LIVE_DATA_SOURCE);
            prop_assert!(DataSourceMode::resolve(Some(&value)).is_mock());
        }
    }

    #[test]
    fn unset_environment_yields_mock_defaults() {
        let config = FeedConfig::from_lookup(|_| None).unwrap();
        assert!(config.is_mock());
        assert!(!config.is_live());
        assert_eq!(config.default_stream.as_str(), DEFAULT_STREAM);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert!(config.supabase.is_none());
        assert_eq!(config.mock.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn live_requires_backend_settings() {
        let missing = FeedConfig::from_lookup(lookup_from(&[("DATA_SOURCE", "supabase")]));
        assert!(matches!(missing, Err(ConfigError::MissingEnvVar(k)) if k == "SUPABASE_URL"));

        let empty = FeedConfig::from_lookup(lookup_from(&[
            ("DATA_SOURCE", "supabase"),
            ("SUPABASE_URL", "https://demo.supabase.co"),
            ("SUPABASE_ANON_KEY", ""),
        ]));
        assert!(matches!(empty, Err(ConfigError::EmptyValue(k)) if k == "SUPABASE_ANON_KEY"));
    }

    #[test]
    fn live_config_reads_overrides() {
        let config = FeedConfig::from_lookup(lookup_from(&[
            ("DATA_SOURCE", "supabase"),
            ("SUPABASE_URL", "https://demo.supabase.co"),
            ("SUPABASE_ANON_KEY", "anon"),
            ("SUPABASE_JOIN_TIMEOUT_SECS", "3"),
            ("DASHBOARD_DEFAULT_STREAM", "btc-usd"),
            ("DASHBOARD_CHANNEL_CAPACITY", "not-a-number"),
        ]))
        .unwrap();

        assert!(config.is_live());
        assert_eq!(config.default_stream.as_str(), "btc-usd");
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);

        let supabase = config.supabase.unwrap();
        assert_eq!(supabase.url, "https://demo.supabase.co");
        assert_eq!(supabase.credentials.api_key(), "anon");
        assert_eq!(supabase.join_timeout, Duration::from_secs(3));
        assert_eq!(supabase.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn backend_settings_ignored_in_mock_mode() {
        let config = FeedConfig::from_lookup(lookup_from(&[
            ("SUPABASE_URL", "https://demo.supabase.co"),
            ("MOCK_TICK_MS", "250"),
        ]))
        .unwrap();

        assert!(config.is_mock());
        assert!(config.supabase.is_none());
        assert_eq!(config.mock.tick_interval, Duration::from_millis(250));
    }

    #[test]
    fn modes_side_by_side() {
        let mock = FeedConfig::new(DataSourceMode::Mock);
        let live = FeedConfig::new(DataSourceMode::Live).with_supabase(SupabaseSettings::new(
            "https://demo.supabase.co".to_string(),
            Credentials::new("k".to_string()),
        ));

        assert!(mock.is_mock());
        assert!(live.is_live());
        assert!(live.supabase.is_some());
    }

    #[test]
    fn credentials_redacted_debug() {
        let creds = Credentials::new("key123".to_string());
        let debug = format!("{creds:?}");
        assert!(!debug.contains("key123"));
        assert!(debug.contains("[REDACTED]"));
    }
}
