//! Phoenix Channel Frames
//!
//! Supabase Realtime speaks the Phoenix channels protocol (`vsn=1.0.0`):
//! every frame is a JSON object with `topic`, `event`, `payload`, `ref` and
//! `join_ref`.
//!
//! # Inbound events
//!
//! - `phx_reply`: answer to a join, leave or heartbeat (`status` ok/error)
//! - `postgres_changes`: one row change under `payload.data`
//! - `phx_error` / `phx_close`: the server dropped a channel
//!
//! Anything else (`presence_state`, `system`, ...) is surfaced as
//! [`Inbound::Other`] and ignored by the client.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::application::ports::{ChangeNotification, ChannelRequest};
use crate::domain::records::{ChangeKind, parse_timestamp};

/// Topic used for connection-level frames.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Join a channel.
pub const PHX_JOIN: &str = "phx_join";
/// Leave a channel.
pub const PHX_LEAVE: &str = "phx_leave";
/// Reply to a client frame.
pub const PHX_REPLY: &str = "phx_reply";
/// Server-side channel crash.
pub const PHX_ERROR: &str = "phx_error";
/// Server-side channel close.
pub const PHX_CLOSE: &str = "phx_close";
/// Connection keep-alive.
pub const HEARTBEAT: &str = "heartbeat";
/// Row change notification.
pub const POSTGRES_CHANGES: &str = "postgres_changes";

/// Frame decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Frame is not valid JSON or lacks the envelope fields.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A `postgres_changes` frame without usable `data`.
    #[error("malformed postgres_changes payload: {0}")]
    MalformedChange(String),
}

/// Raw Phoenix frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    /// Channel topic (`realtime:<name>`), or `phoenix`.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Message reference, echoed in replies.
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    /// Reference of the join that opened the channel.
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    /// Join frame registering every binding of `request` on `topic`.
    #[must_use]
    pub fn join(topic: &str, join_ref: &str, request: &ChannelRequest, access_token: &str) -> Self {
        let bindings: Vec<Value> = request
            .bindings
            .iter()
            .map(|b| {
                let mut binding = json!({
                    "event": b.selector.as_str(),
                    "schema": b.schema,
                    "table": b.table,
                });
                if let Some(filter) = &b.filter {
                    binding["filter"] = Value::String(filter.to_string());
                }
                binding
            })
            .collect();

        Self {
            topic: topic.to_string(),
            event: PHX_JOIN.to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": bindings,
                },
                "access_token": access_token,
            }),
            msg_ref: Some(join_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Leave frame for a joined channel.
    #[must_use]
    pub fn leave(topic: &str, msg_ref: &str, join_ref: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: PHX_LEAVE.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: Some(join_ref.to_string()),
        }
    }

    /// Connection heartbeat.
    #[must_use]
    pub fn heartbeat(msg_ref: &str) -> Self {
        Self {
            topic: PHOENIX_TOPIC.to_string(),
            event: HEARTBEAT.to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }

    /// Serialize to a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Outcome carried by a `phx_reply`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    /// `status: ok`, with the server's response.
    Ok(Value),
    /// Any other status, with the best available reason.
    Error(String),
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a frame we sent.
    Reply {
        /// Channel topic.
        topic: String,
        /// Reference of the frame being answered.
        msg_ref: Option<String>,
        /// Server verdict.
        outcome: ReplyOutcome,
    },
    /// Row change on a channel.
    Change {
        /// Channel topic.
        topic: String,
        /// Decoded change.
        notification: ChangeNotification,
    },
    /// Server crashed the channel.
    ChannelError {
        /// Channel topic.
        topic: String,
    },
    /// Server closed the channel.
    ChannelClose {
        /// Channel topic.
        topic: String,
    },
    /// Event the client does not act on.
    Other {
        /// Channel topic.
        topic: String,
        /// Event name.
        event: String,
    },
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    schema: String,
    table: String,
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

/// Decode a text frame.
///
/// # Errors
///
/// Returns `FrameError` if the frame is not a Phoenix envelope or a change
/// payload is unusable.
pub fn decode(text: &str) -> Result<Inbound, FrameError> {
    let message: PhoenixMessage = serde_json::from_str(text)?;
    let PhoenixMessage {
        topic,
        event,
        payload,
        msg_ref,
        ..
    } = message;

    let inbound = match event.as_str() {
        PHX_REPLY => Inbound::Reply {
            topic,
            msg_ref,
            outcome: reply_outcome(payload),
        },
        POSTGRES_CHANGES => Inbound::Change {
            topic,
            notification: decode_change(payload)?,
        },
        PHX_ERROR => Inbound::ChannelError { topic },
        PHX_CLOSE => Inbound::ChannelClose { topic },
        _ => Inbound::Other { topic, event },
    };

    Ok(inbound)
}

fn reply_outcome(mut payload: Value) -> ReplyOutcome {
    let response = payload
        .get_mut("response")
        .map(Value::take)
        .unwrap_or(Value::Null);

    match payload.get("status").and_then(Value::as_str) {
        Some("ok") => ReplyOutcome::Ok(response),
        status => {
            let reason = response
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| status.map(|s| format!("status {s}")))
                .unwrap_or_else(|| "reply without status".to_string());
            ReplyOutcome::Error(reason)
        }
    }
}

fn decode_change(mut payload: Value) -> Result<ChangeNotification, FrameError> {
    let data = payload
        .get_mut("data")
        .map(Value::take)
        .ok_or_else(|| FrameError::MalformedChange("missing data".to_string()))?;
    let data: ChangeData =
        serde_json::from_value(data).map_err(|e| FrameError::MalformedChange(e.to_string()))?;

    let record = match data.kind {
        ChangeKind::Delete => data.old_record.or(data.record),
        ChangeKind::Insert | ChangeKind::Update => data.record,
    }
    .ok_or_else(|| FrameError::MalformedChange("missing record".to_string()))?;

    Ok(ChangeNotification {
        schema: data.schema,
        table: data.table,
        kind: data.kind,
        record,
        commit_timestamp: data.commit_timestamp.as_deref().and_then(parse_timestamp),
    })
}
