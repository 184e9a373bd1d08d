//! Response dispatch
//!
//! Formats an invocation outcome into outbound chat actions. Raw
//! failure detail stays in the log; the chat only ever sees a generic
//! apology (or a "busy" note for backlog rejection). Long replies are
//! split into ordered segments under the configured length cap.

use tracing::warn;

use crate::config::Config;
use crate::invoker::InvocationOutcome;
use crate::onebot::{ConversationKey, OutboundAction};

/// Notice sent before invoking the engine, when enabled
pub const THINKING_NOTICE: &str = "Claude is thinking...";

/// Generic user-facing failure text; never carries internal detail
pub const FAILURE_MESSAGE: &str =
    "Sorry, I couldn't produce a reply this time. Please try again later.";

/// User-facing text for backlog/concurrency-cap rejection
pub const BUSY_MESSAGE: &str =
    "I'm still working on earlier messages for this chat. Please try again in a moment.";

/// Map an invocation outcome to zero or more outbound actions
pub fn dispatch(key: ConversationKey, outcome: &InvocationOutcome, config: &Config) -> Vec<OutboundAction> {
    match outcome {
        InvocationOutcome::Success { text, cost_usd } => {
            let mut reply = text.clone();
            if config.cost_suffix && *cost_usd > 0.0 {
                reply.push_str(&format!("\n\n(cost: ${:.4})", cost_usd));
            }
            split_message(&reply, config.max_message_len)
                .into_iter()
                .map(|segment| OutboundAction::message(key, segment))
                .collect()
        }
        InvocationOutcome::Timeout => {
            warn!(%key, "reporting timeout to chat as generic failure");
            vec![OutboundAction::message(key, FAILURE_MESSAGE)]
        }
        InvocationOutcome::ProcessFailure(detail) => {
            warn!(%key, %detail, "reporting process failure to chat as generic failure");
            vec![OutboundAction::message(key, FAILURE_MESSAGE)]
        }
        InvocationOutcome::Cancelled => Vec::new(),
    }
}

/// The pre-invocation notice action
pub fn thinking_notice(key: ConversationKey) -> OutboundAction {
    OutboundAction::message(key, THINKING_NOTICE)
}

/// The backlog-rejection action, sent instead of invoking at all
pub fn busy_notice(key: ConversationKey) -> OutboundAction {
    OutboundAction::message(key, BUSY_MESSAGE)
}

/// Split `text` into ordered segments of at most `max_len` characters.
/// Splitting is by character count, never inside a code point.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut segments = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for ch in text.chars() {
        current.push(ch);
        count += 1;
        if count == max_len {
            segments.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}
