//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (the backend change feed).
pub mod ports;

/// Application services for subscription routing and lifecycle.
pub mod services;
