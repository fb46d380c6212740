//! Event Routing Policy
//!
//! Decides which callbacks see an inbound record.
//!
//! # Rules
//!
//! - The generic handler, when present, sees every event record exactly once.
//! - On top of that, at most one specialized handler fires, chosen by the
//!   record's discriminant (`decision` or `belief`).
//! - Unknown discriminants and missing handlers are not errors; the record is
//!   simply not dispatched further.
//! - Trades are homogeneous: every trade goes to the single trade handler.

use std::fmt;
use std::sync::Arc;

use crate::domain::records::{EventRecord, FeedEvent, TradeEvent};

/// Callback receiving an `events` row.
pub type EventHandler = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Callback receiving a `trades` change.
pub type TradeHandler = Arc<dyn Fn(&TradeEvent) + Send + Sync>;

/// Wrap a closure as a [`TradeHandler`].
pub fn trade_handler<F>(f: F) -> TradeHandler
where
    F: Fn(&TradeEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Handler classes, used for dispatch accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerClass {
    /// Catch-all event handler.
    Generic,
    /// Decision handler.
    Decision,
    /// Belief handler.
    Belief,
    /// Trade handler.
    Trade,
}

impl HandlerClass {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Decision => "decision",
            Self::Belief => "belief",
            Self::Trade => "trade",
        }
    }
}

// =============================================================================
// Callback Set
// =============================================================================

/// Optional handlers for the `events` table.
///
/// # Example
///
/// ```rust
/// use dashboard_feed::domain::routing::EventCallbacks;
///
/// let callbacks = EventCallbacks::new()
///     .on_event(|record| println!("event {}", record.event_type_str()))
///     .on_decision(|record| println!("decision {:?}", record.field("action")));
///
/// assert!(callbacks.has_generic());
/// assert!(!callbacks.has_belief());
/// ```
#[derive(Clone, Default)]
pub struct EventCallbacks {
    on_event: Option<EventHandler>,
    on_decision: Option<EventHandler>,
    on_belief: Option<EventHandler>,
}

impl EventCallbacks {
    /// Empty callback set; nothing is dispatched.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler for every event, whatever its type.
    #[must_use]
    pub fn on_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.on_event = Some(Arc::new(f));
        self
    }

    /// Handler for `decision` events.
    #[must_use]
    pub fn on_decision<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.on_decision = Some(Arc::new(f));
        self
    }

    /// Handler for `belief` events.
    #[must_use]
    pub fn on_belief<F>(mut self, f: F) -> Self
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        self.on_belief = Some(Arc::new(f));
        self
    }

    /// Whether a generic handler is registered.
    #[must_use]
    pub const fn has_generic(&self) -> bool {
        self.on_event.is_some()
    }

    /// Whether a decision handler is registered.
    #[must_use]
    pub const fn has_decision(&self) -> bool {
        self.on_decision.is_some()
    }

    /// Whether a belief handler is registered.
    #[must_use]
    pub const fn has_belief(&self) -> bool {
        self.on_belief.is_some()
    }

    /// Whether no handler at all is registered.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.has_generic() && !self.has_decision() && !self.has_belief()
    }

    /// Fan one classified event out to the registered handlers.
    ///
    /// Generic first, then the specialized handler for the event's class.
    pub fn dispatch(&self, event: &FeedEvent) -> Dispatched {
        let record = event.record();
        let mut dispatched = Dispatched::default();

        if let Some(handler) = &self.on_event {
            handler(record);
            dispatched.generic = true;
        }

        let specialized = match event {
            FeedEvent::Decision(_) => self
                .on_decision
                .as_ref()
                .map(|h| (h, HandlerClass::Decision)),
            FeedEvent::Belief(_) => self.on_belief.as_ref().map(|h| (h, HandlerClass::Belief)),
            FeedEvent::Generic(_) => None,
        };

        if let Some((handler, class)) = specialized {
            handler(record);
            dispatched.specialized = Some(class);
        }

        dispatched
    }
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("on_event", &self.has_generic())
            .field("on_decision", &self.has_decision())
            .field("on_belief", &self.has_belief())
            .finish()
    }
}

/// Which handlers fired for one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    /// Generic handler fired.
    pub generic: bool,
    /// Specialized handler that fired, if any.
    pub specialized: Option<HandlerClass>,
}

impl Dispatched {
    /// Number of handler invocations.
    #[must_use]
    pub const fn count(&self) -> usize {
        self.generic as usize + self.specialized.is_some() as usize
    }
}

/// Forward one trade change to the trade handler.
pub fn dispatch_trade(handler: &TradeHandler, event: &TradeEvent) {
    handler(event);
}

// =============================================================================
// Tests
// =============================================================================
