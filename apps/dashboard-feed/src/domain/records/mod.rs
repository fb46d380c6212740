//! Change Feed Record Types
//!
//! Typed views of the rows the backend pushes for the `events` and `trades`
//! tables. Raw JSON is decoded once at the subscription boundary; everything
//! past that point works with these types.
//!
//! Decoding is lenient: only `session_id` is required. Columns without a
//! dedicated field, and typed columns whose value does not fit the type,
//! are preserved verbatim in `fields`, so callbacks still see the whole
//! record.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Identifiers
// =============================================================================

/// Key partitioning independent logical data streams (one per session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Create a stream identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for StreamId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Primary key of a row. Tables may use integer or UUID keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    /// Integer (serial/bigint) key.
    Int(i64),
    /// Text or UUID key.
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

// =============================================================================
// Tables and Change Kinds
// =============================================================================

/// Backend tables this crate subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Agent events: decisions, belief updates and everything else.
    Events,
    /// Executed trades.
    Trades,
}

impl Table {
    /// Table name as known by the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Trades => "trades",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of row change carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// New row.
    Insert,
    /// Modified row.
    Update,
    /// Removed row.
    Delete,
}

impl ChangeKind {
    /// Wire name (`INSERT`, `UPDATE`, `DELETE`).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

// =============================================================================
// Events Table
// =============================================================================

/// Discriminant of an `events` row (`event_type` column).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// A trading decision made by the agent.
    Decision,
    /// A belief/confidence update.
    Belief,
    /// Any other event type, kept as sent.
    Other(String),
}

impl EventKind {
    /// Wire value for decisions.
    pub const DECISION: &'static str = "decision";
    /// Wire value for belief updates.
    pub const BELIEF: &'static str = "belief";

    /// Classify a raw `event_type` value.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            Self::DECISION => Self::Decision,
            Self::BELIEF => Self::Belief,
            other => Self::Other(other.to_string()),
        }
    }

    /// Wire value of this kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Decision => Self::DECISION,
            Self::Belief => Self::BELIEF,
            Self::Other(other) => other,
        }
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

/// A row from the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    /// Row key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Stream the event belongs to.
    pub session_id: StreamId,
    /// Routing discriminant; `None` when absent or not a string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventKind>,
    /// Row creation time, when present and parseable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Every other column, plus any typed column whose value did not fit,
    /// verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventRecord {
    /// Decode a raw change-feed row.
    ///
    /// Only the stream column is required. A typed column holding a value
    /// of the wrong shape is left in `fields` and its typed field is `None`.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` if the row is not an object or has no usable
    /// `session_id`.
    pub fn decode(record: Value) -> Result<Self, DecodeError> {
        let mut columns = Columns::new(record)?;
        Ok(Self {
            session_id: columns.stream()?,
            id: columns.take("id", typed),
            event_type: columns.take("event_type", |v| v.as_str().map(EventKind::parse)),
            created_at: columns.take("created_at", timestamp),
            fields: columns.into_fields(),
        })
    }

    /// Wire value of the discriminant, empty when there is none.
    #[must_use]
    pub fn event_type_str(&self) -> &str {
        self.event_type.as_ref().map_or("", EventKind::as_str)
    }

    /// Look up an extra column by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// An `events` row classified by its discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// `event_type = decision`.
    Decision(EventRecord),
    /// `event_type = belief`.
    Belief(EventRecord),
    /// Any other discriminant.
    Generic(EventRecord),
}

impl FeedEvent {
    /// Classify a decoded record.
    #[must_use]
    pub fn classify(record: EventRecord) -> Self {
        match record.event_type {
            Some(EventKind::Decision) => Self::Decision(record),
            Some(EventKind::Belief) => Self::Belief(record),
            Some(EventKind::Other(_)) | None => Self::Generic(record),
        }
    }

    /// Decode and classify a raw row in one step.
    ///
    /// # Errors
    ///
    /// See [`EventRecord::decode`].
    pub fn decode(record: Value) -> Result<Self, DecodeError> {
        EventRecord::decode(record).map(Self::classify)
    }

    /// The underlying record, whatever its class.
    #[must_use]
    pub const fn record(&self) -> &EventRecord {
        match self {
            Self::Decision(record) | Self::Belief(record) | Self::Generic(record) => record,
        }
    }
}

// =============================================================================
// Trades Table
// =============================================================================

/// Side of an executed trade.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TradeSide {
    /// Buy side.
    Buy,
    /// Sell side.
    Sell,
    /// Anything else the backend sends.
    Other(String),
}

impl From<String> for TradeSide {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "buy" => Self::Buy,
            "sell" => Self::Sell,
            _ => Self::Other(value),
        }
    }
}

impl From<TradeSide> for String {
    fn from(side: TradeSide) -> Self {
        match side {
            TradeSide::Buy => "buy".to_string(),
            TradeSide::Sell => "sell".to_string(),
            TradeSide::Other(other) => other,
        }
    }
}

/// A row from the `trades` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    /// Row key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    /// Stream the trade belongs to.
    pub session_id: StreamId,
    /// Traded instrument.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Buy or sell.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub side: Option<TradeSide>,
    /// Execution price.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Executed quantity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Decimal>,
    /// Backend status string (e.g. `pending`, `filled`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Execution time, when present and parseable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    /// Every other column, plus any typed column whose value did not fit,
    /// verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TradeRecord {
    /// Decode a raw change-feed row.
    ///
    /// Same rules as [`EventRecord::decode`]: only `session_id` is required
    /// and mistyped columns stay in `fields`.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` if the row is not an object or has no usable
    /// `session_id`.
    pub fn decode(record: Value) -> Result<Self, DecodeError> {
        let mut columns = Columns::new(record)?;
        Ok(Self {
            session_id: columns.stream()?,
            id: columns.take("id", typed),
            symbol: columns.take("symbol", typed),
            side: columns.take("side", |v| v.as_str().map(|s| TradeSide::from(s.to_string()))),
            price: columns.take("price", typed),
            quantity: columns.take("quantity", typed),
            status: columns.take("status", typed),
            executed_at: columns.take("executed_at", timestamp),
            fields: columns.into_fields(),
        })
    }
}

/// A trade row together with the change that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeEvent {
    /// Insert or update.
    pub change: ChangeKind,
    /// The row after the change.
    pub trade: TradeRecord,
}

// =============================================================================
// Decoding
// =============================================================================

/// Errors raised while decoding a change-feed row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Row is not a JSON object.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// Row has no `session_id`, or it is null.
    #[error("record has no session_id")]
    MissingStream,

    /// `session_id` is not a scalar.
    #[error("session_id must be a scalar, got {0}")]
    InvalidStream(&'static str),
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Columns of one row, consumed as typed fields are pulled out.
struct Columns(Map<String, Value>);

impl Columns {
    fn new(record: Value) -> Result<Self, DecodeError> {
        match record {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DecodeError::NotAnObject(json_type(&other))),
        }
    }

    /// Same scalar rendering as the stream filter, so every row a filter
    /// admits decodes.
    fn stream(&mut self) -> Result<StreamId, DecodeError> {
        match self.0.remove(STREAM_FIELD) {
            Some(Value::String(id)) => Ok(StreamId(id)),
            Some(scalar @ (Value::Number(_) | Value::Bool(_))) => Ok(StreamId(scalar.to_string())),
            Some(Value::Null) | None => Err(DecodeError::MissingStream),
            Some(other) => Err(DecodeError::InvalidStream(json_type(&other))),
        }
    }

    /// Remove and convert `name`. Null counts as absent; a value that does
    /// not convert stays in the row.
    fn take<T>(&mut self, name: &str, convert: impl FnOnce(&Value) -> Option<T>) -> Option<T> {
        let converted = match self.0.get(name)? {
            Value::Null => None,
            value => Some(convert(value)?),
        };
        self.0.remove(name);
        converted
    }

    fn into_fields(self) -> Map<String, Value> {
        self.0
    }
}

/// Column carrying the stream identifier.
const STREAM_FIELD: &str = "session_id";

fn typed<T: DeserializeOwned>(value: &Value) -> Option<T> {
    T::deserialize(value).ok()
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value.as_str().and_then(parse_timestamp)
}

/// Parse a Postgres timestamp as delivered by the change feed.
///
/// Accepts RFC 3339 (`timestamptz`) and zone-less (`timestamp`, read as UTC)
/// forms.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Postgres text output uses a space separator and short offsets
    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Tests
// =============================================================================
