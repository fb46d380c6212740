//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Configuration and data-source selection.
pub mod config;

/// In-process change feed (mock mode and tests).
pub mod memory;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Synthetic data generator for mock mode.
pub mod mock;

/// Supabase Realtime change feed (live mode).
pub mod realtime;

/// Tracing subscriber and OpenTelemetry integration.
pub mod telemetry;
