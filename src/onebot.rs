//! OneBot v11 wire protocol
//!
//! Event and action shapes exchanged with the chat gateway (NapCat or
//! any OneBot v11 implementation) as JSON text frames. Only the message
//! events the bridge reacts to are modeled; every other `post_type`
//! (heartbeats, notices, requests) is skipped by the parser.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Identifies one isolated conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// Private chat with a user
    Private(u64),
    /// Group chat
    Group(u64),
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Private(id) => write!(f, "private:{}", id),
            Self::Group(id) => write!(f, "group:{}", id),
        }
    }
}

/// A chat message event received from the gateway
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// Conversation this message belongs to
    pub key: ConversationKey,
    /// Sender's user id
    pub sender: u64,
    /// Plain text extracted from the message segments, trimmed
    pub text: String,
    /// Whether the bot was mentioned (group chats)
    pub to_me: bool,
    /// Private message from a temporary (non-friend) session
    pub temp_session: bool,
    /// Gateway-assigned message id, for logging and idempotence only
    pub message_id: i64,
}

/// An action to push back to the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundAction {
    SendPrivate { user_id: u64, message: String },
    SendGroup { group_id: u64, message: String },
}

impl OutboundAction {
    /// Build the send-message action addressing the given conversation
    pub fn message(key: ConversationKey, text: impl Into<String>) -> Self {
        match key {
            ConversationKey::Private(user_id) => Self::SendPrivate {
                user_id,
                message: text.into(),
            },
            ConversationKey::Group(group_id) => Self::SendGroup {
                group_id,
                message: text.into(),
            },
        }
    }

    /// Message text carried by this action
    pub fn text(&self) -> &str {
        match self {
            Self::SendPrivate { message, .. } | Self::SendGroup { message, .. } => message,
        }
    }

    /// Serialize to the OneBot action frame
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        struct Frame<'a, P: Serialize> {
            action: &'a str,
            params: P,
        }

        let frame = match self {
            Self::SendPrivate { user_id, message } => serde_json::to_string(&Frame {
                action: "send_private_msg",
                params: serde_json::json!({ "user_id": user_id, "message": message }),
            }),
            Self::SendGroup { group_id, message } => serde_json::to_string(&Frame {
                action: "send_group_msg",
                params: serde_json::json!({ "group_id": group_id, "message": message }),
            }),
        };
        // Serializing a string/number map cannot fail
        frame.unwrap_or_default()
    }
}

/// Raw event frame as it appears on the wire
#[derive(Debug, Deserialize)]
struct RawEvent {
    post_type: Option<String>,
    message_type: Option<String>,
    #[serde(default)]
    sub_type: Option<String>,
    user_id: Option<u64>,
    group_id: Option<u64>,
    #[serde(default)]
    message_id: Option<i64>,
    /// Convenience flag some gateways set when the bot is addressed
    #[serde(default)]
    to_me: Option<bool>,
    message: Option<Value>,
}

/// One entry of a segmented message
#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Parse a gateway text frame.
///
/// Returns `Ok(None)` for valid frames the bridge does not react to
/// (meta events, API echoes, notices). Malformed JSON or a message
/// frame missing its addressing fields is a `Parse` error; the caller
/// drops the frame and keeps the connection.
pub fn parse_event(raw: &str, self_id: u64) -> Result<Option<InboundEvent>, GatewayError> {
    let event: RawEvent = serde_json::from_str(raw)
        .map_err(|e| GatewayError::Parse(format!("invalid JSON: {}", e)))?;

    if event.post_type.as_deref() != Some("message") {
        return Ok(None);
    }

    let sender = event
        .user_id
        .ok_or_else(|| GatewayError::Parse("message event without user_id".to_string()))?;

    let key = match event.message_type.as_deref() {
        Some("private") => ConversationKey::Private(sender),
        Some("group") => {
            let group_id = event
                .group_id
                .ok_or_else(|| GatewayError::Parse("group message without group_id".to_string()))?;
            ConversationKey::Group(group_id)
        }
        other => {
            return Err(GatewayError::Parse(format!(
                "unknown message_type: {:?}",
                other
            )));
        }
    };

    let (text, mentioned) = extract_text(event.message.as_ref(), self_id);

    Ok(Some(InboundEvent {
        key,
        sender,
        text,
        to_me: event.to_me.unwrap_or(false) || mentioned,
        temp_session: matches!(key, ConversationKey::Private(_))
            && event.sub_type.as_deref() != Some("friend"),
        message_id: event.message_id.unwrap_or(0),
    }))
}

/// Concatenate text segments and detect an `at` mention of `self_id`.
///
/// Mentions arrive as dedicated `at` segments, so the returned text is
/// already free of the mention token.
fn extract_text(message: Option<&Value>, self_id: u64) -> (String, bool) {
    let mut text = String::new();
    let mut mentioned = false;

    match message {
        // Array-of-segments form (NapCat default)
        Some(Value::Array(items)) => {
            for item in items {
                let Ok(segment) = serde_json::from_value::<Segment>(item.clone()) else {
                    continue;
                };
                match segment.kind.as_str() {
                    "text" => {
                        if let Some(t) = segment.data.get("text").and_then(Value::as_str) {
                            text.push_str(t);
                        }
                    }
                    "at" => {
                        if segment_targets(&segment.data, self_id) {
                            mentioned = true;
                        }
                    }
                    _ => {}
                }
            }
        }
        // Plain string form; a CQ-code mention is left as-is
        Some(Value::String(s)) => text.push_str(s),
        _ => {}
    }

    (text.trim().to_string(), mentioned)
}

/// The `qq` field of an `at` segment may be a number or a string.
/// Only the bot's own id counts; an `@all` broadcast is not a mention.
fn segment_targets(data: &Value, self_id: u64) -> bool {
    match data.get("qq") {
        Some(Value::Number(n)) => n.as_u64() == Some(self_id),
        Some(Value::String(s)) => s == &self_id.to_string(),
        _ => false,
    }
}
