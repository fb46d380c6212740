//! Dashboard Feed Binary
//!
//! Resolves the data source, opens event and trade subscriptions for the
//! default stream and logs every routed record until shutdown.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin dashboard-feed
//! ```
//!
//! # Environment Variables
//!
//! ## Data source
//! - `DATA_SOURCE`: `supabase` for live data, anything else for mock (default: mock)
//!
//! ## Required when live
//! - `SUPABASE_URL`: Project URL
//! - `SUPABASE_ANON_KEY`: Anonymous API key
//!
//! ## Optional
//! - `DASHBOARD_DEFAULT_STREAM`: Stream subscribed to (default: default)
//! - `DASHBOARD_CHANNEL_CAPACITY`: Buffered notifications per channel (default: 1024)
//! - `DASHBOARD_METRICS_PORT`: Prometheus metrics port, 0 to disable (default: 9091)
//! - `SUPABASE_HEARTBEAT_SECS`: Realtime heartbeat interval (default: 30)
//! - `SUPABASE_JOIN_TIMEOUT_SECS`: Channel join timeout (default: 10)
//! - `MOCK_TICK_MS`: Synthetic batch interval (default: 1000)
//! - `OTEL_ENABLED`: Enable OpenTelemetry export (default: false)
//! - `RUST_LOG`: Log filter (default: dashboard_feed=info)

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use dashboard_feed::infrastructure::telemetry;
use dashboard_feed::{
    ChangeFeed, DataSourceMode, EventCallbacks, FeedConfig, InMemoryChangeFeed, RealtimeClient,
    RealtimeClientConfig, RealtimeRouter, SubscriptionHandle, SyntheticGenerator, init_metrics,
    trade_handler,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Already installed is fine.
    let _ = rustls::crypto::ring::default_provider().install_default();

    load_dotenv();

    let _telemetry_guard = telemetry::init().context("failed to initialize telemetry")?;

    tracing::info!("Starting Dashboard Feed");

    let config = FeedConfig::from_env()?;
    log_config(&config);

    let metrics_addr = (config.metrics_port != 0)
        .then(|| SocketAddr::from(([0, 0, 0, 0], config.metrics_port)));
    init_metrics(metrics_addr).context("failed to install metrics recorder")?;

    let shutdown_token = CancellationToken::new();
    let feed = build_feed(&config, &shutdown_token).await?;
    let router = RealtimeRouter::new(feed, config.default_stream.clone());

    let events = router.open_event_subscription(None, event_callbacks());
    let trades = router.open_trade_subscription(
        None,
        trade_handler(|event| {
            tracing::info!(
                change = event.change.as_str(),
                symbol = event.trade.symbol.as_deref().unwrap_or("-"),
                status = event.trade.status.as_deref().unwrap_or("-"),
                price = ?event.trade.price,
                "Trade"
            );
        }),
    );

    for handle in [&events, &trades] {
        if let Err(e) = handle.activated().await {
            tracing::error!(channel = handle.name(), error = %e, "Subscription not active");
        }
    }

    tracing::info!(stream = %router.default_stream(), "Dashboard feed ready");

    await_shutdown().await;

    close_all(&router, [events, trades]).await;
    shutdown_token.cancel();

    tracing::info!("Dashboard feed stopped");
    Ok(())
}

/// Build the change feed for the configured mode.
async fn build_feed(
    config: &FeedConfig,
    shutdown_token: &CancellationToken,
) -> anyhow::Result<Arc<dyn ChangeFeed>> {
    match config.mode() {
        DataSourceMode::Mock => {
            let feed = Arc::new(InMemoryChangeFeed::new(config.channel_capacity));
            let generator = SyntheticGenerator::new(
                Arc::clone(&feed),
                config.default_stream.clone(),
                config.mock.clone(),
                shutdown_token.child_token(),
            );
            tokio::spawn(generator.run());
            Ok(feed)
        }
        DataSourceMode::Live => {
            let settings = config
                .supabase
                .as_ref()
                .context("live mode requires Supabase settings")?;
            let client_config =
                RealtimeClientConfig::from_settings(settings, config.channel_capacity)?;
            let client = RealtimeClient::connect(client_config, shutdown_token.child_token())
                .await
                .context("failed to connect to Supabase Realtime")?;
            Ok(client)
        }
    }
}

fn event_callbacks() -> EventCallbacks {
    EventCallbacks::default()
        .on_event(|record| {
            tracing::debug!(
                event_type = record.event_type_str(),
                id = ?record.id,
                "Event"
            );
        })
        .on_decision(|record| {
            tracing::info!(
                action = ?record.field("action"),
                symbol = ?record.field("symbol"),
                "Decision"
            );
        })
        .on_belief(|record| {
            tracing::info!(symbol = ?record.field("symbol"), "Belief");
        })
}

async fn close_all<const N: usize>(router: &RealtimeRouter, handles: [SubscriptionHandle; N]) {
    for handle in handles {
        if let Err(e) = router.close_subscription(&handle).await {
            tracing::warn!(channel = handle.name(), error = %e, "Failed to close subscription");
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    tracing::info!(
        data_source = config.mode().as_str(),
        default_stream = %config.default_stream,
        channel_capacity = config.channel_capacity,
        metrics_port = config.metrics_port,
        "Configuration loaded"
    );
    if let Some(supabase) = &config.supabase {
        tracing::debug!(
            url = %supabase.url,
            heartbeat_secs = supabase.heartbeat_interval.as_secs(),
            join_timeout_secs = supabase.join_timeout.as_secs(),
            "Realtime endpoint"
        );
    }
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
