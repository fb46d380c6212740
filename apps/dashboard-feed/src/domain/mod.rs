//! Domain Layer - Change feed records and routing policy.
//!
//! Pure types with no I/O: decoding of backend rows into typed records,
//! server-side filter expressions, and the rules deciding which callback
//! sees which record.

/// Server-side row filters (`<column>=eq.<value>`).
pub mod filter;

/// Typed rows for the `events` and `trades` tables.
pub mod records;

/// Callback sets and the dispatch policy.
pub mod routing;
