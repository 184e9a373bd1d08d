//! Event classification
//!
//! Pure mapping from an inbound event to the bridge's reaction. Rule
//! order is a fixed contract: private auto-reply, then group mention,
//! then command prefix (longest prefix wins), then ignore.

use crate::config::Config;
use crate::onebot::{ConversationKey, InboundEvent};

/// What to do with an inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// No reaction
    Ignore,
    /// Invoke the assistant with the stripped user content. An empty
    /// string is legal here; the supervisor drops it without
    /// scheduling an invocation.
    Reply(String),
}

/// Classify one inbound event against the configured rules
pub fn classify(event: &InboundEvent, config: &Config) -> Intent {
    if let ConversationKey::Private(_) = event.key {
        if event.temp_session && config.ignore_temp_session {
            return Intent::Ignore;
        }
        if config.auto_reply_private {
            return Intent::Reply(event.text.trim().to_string());
        }
    }

    if let ConversationKey::Group(_) = event.key {
        if event.to_me {
            // The at-segment is already gone from the extracted text
            return Intent::Reply(event.text.trim().to_string());
        }
    }

    // Prefixes are sorted longest-first at config load, so "/claude"
    // can never be consumed as "/c" plus remainder
    for prefix in &config.command_prefixes {
        if let Some(rest) = event.text.strip_prefix(prefix.as_str()) {
            return Intent::Reply(rest.trim().to_string());
        }
    }

    Intent::Ignore
}

#[cfg(test)]
mod tests {
    use super::*;

    fn private_event(text: &str) -> InboundEvent {
        InboundEvent {
            key: ConversationKey::Private(42),
            sender: 42,
            text: text.to_string(),
            to_me: false,
            temp_session: false,
            message_id: 1,
        }
    }

    fn group_event(text: &str, to_me: bool) -> InboundEvent {
        InboundEvent {
            key: ConversationKey::Group(900),
            sender: 42,
            text: text.to_string(),
            to_me,
            temp_session: false,
            message_id: 1,
        }
    }

    #[test]
    fn private_auto_reply() {
        let config = Config::default();
        assert_eq!(
            classify(&private_event("hello"), &config),
            Intent::Reply("hello".to_string())
        );
    }

    #[test]
    fn private_auto_reply_disabled_falls_through_to_prefix() {
        let config = Config {
            auto_reply_private: false,
            ..Config::default()
        };
        assert_eq!(classify(&private_event("hello"), &config), Intent::Ignore);
        assert_eq!(
            classify(&private_event("/ask what's the weather"), &config),
            Intent::Reply("what's the weather".to_string())
        );
    }

    #[test]
    fn temp_session_is_ignored_when_configured() {
        let config = Config::default();
        let mut event = private_event("hello");
        event.temp_session = true;
        assert_eq!(classify(&event, &config), Intent::Ignore);

        let config = Config {
            ignore_temp_session: false,
            ..Config::default()
        };
        assert_eq!(
            classify(&event, &config),
            Intent::Reply("hello".to_string())
        );
    }

    #[test]
    fn group_requires_mention() {
        let config = Config::default();
        assert_eq!(
            classify(&group_event("explain this", true), &config),
            Intent::Reply("explain this".to_string())
        );
        assert_eq!(
            classify(&group_event("explain this", false), &config),
            Intent::Ignore
        );
    }

    #[test]
    fn longest_prefix_wins() {
        let config = Config {
            auto_reply_private: false,
            ..Config::default()
        };
        // "/claude" must not be consumed as "/c" + "laude ..."
        assert_eq!(
            classify(&private_event("/claude explain"), &config),
            Intent::Reply("explain".to_string())
        );
        assert_eq!(
            classify(&private_event("/c explain"), &config),
            Intent::Reply("explain".to_string())
        );
    }

    #[test]
    fn empty_command_body_yields_empty_reply() {
        let config = Config {
            auto_reply_private: false,
            ..Config::default()
        };
        assert_eq!(
            classify(&private_event("/c"), &config),
            Intent::Reply(String::new())
        );
    }

    #[test]
    fn unmatched_text_is_ignored() {
        let config = Config {
            auto_reply_private: false,
            ..Config::default()
        };
        assert_eq!(
            classify(&private_event("just chatting"), &config),
            Intent::Ignore
        );
    }
}
