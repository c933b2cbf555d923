//! Maps one worker output record to one typed protocol event.
//!
//! Categories overlap textually (a chat line can mention "joined the chat"),
//! so classification walks an ordered rule table and the first match wins.

use shared::protocol::{
    sender_tag, ProtocolEvent, DIAGNOSTIC_MARKER, IMAGE_DELIMITER, JOINED_SUFFIX,
    VOICE_JOINED_SUFFIX, VOICE_LEFT_SUFFIX,
};

/// Read-only context supplied by the bridge for each record.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext<'a> {
    pub current_username: Option<&'a str>,
}

impl<'a> ClassifyContext<'a> {
    pub fn for_user(username: &'a str) -> Self {
        Self {
            current_username: Some(username),
        }
    }

    fn is_self_tagged(&self, text: &str) -> bool {
        self.current_username
            .is_some_and(|username| text.contains(&sender_tag(username)))
    }
}

pub struct Rule {
    pub name: &'static str,
    pub apply: fn(&str, &ClassifyContext<'_>) -> Option<ProtocolEvent>,
}

pub const RULES: &[Rule] = &[
    Rule {
        name: "diagnostic",
        apply: diagnostic_rule,
    },
    Rule {
        name: "image",
        apply: image_rule,
    },
    Rule {
        name: "roster_join",
        apply: roster_join_rule,
    },
    Rule {
        name: "voice_join",
        apply: voice_join_rule,
    },
    Rule {
        name: "voice_leave",
        apply: voice_leave_rule,
    },
];

pub fn classify(record: &str, ctx: &ClassifyContext<'_>) -> ProtocolEvent {
    let record = record.trim();
    RULES
        .iter()
        .find_map(|rule| (rule.apply)(record, ctx))
        .unwrap_or_else(|| ProtocolEvent::ChatText {
            sender_is_self: ctx.is_self_tagged(record),
            text: record.to_string(),
        })
}

/// Name of the first rule matching `record`, or `None` when it falls through to chat text.
pub fn matching_rule(record: &str, ctx: &ClassifyContext<'_>) -> Option<&'static str> {
    let record = record.trim();
    RULES
        .iter()
        .find(|rule| (rule.apply)(record, ctx).is_some())
        .map(|rule| rule.name)
}

fn diagnostic_rule(record: &str, _ctx: &ClassifyContext<'_>) -> Option<ProtocolEvent> {
    record
        .contains(DIAGNOSTIC_MARKER)
        .then(|| ProtocolEvent::Diagnostic {
            raw: record.to_string(),
        })
}

fn image_rule(record: &str, ctx: &ClassifyContext<'_>) -> Option<ProtocolEvent> {
    let (sender, payload) = record.split_once(IMAGE_DELIMITER)?;
    let sender_tag = format!("{sender}]:");
    Some(ProtocolEvent::Image {
        sender_is_self: ctx.is_self_tagged(&sender_tag),
        payload: payload.to_string(),
    })
}

fn username_before<'a>(record: &'a str, suffix: &str) -> Option<&'a str> {
    record
        .strip_suffix(suffix)
        .map(str::trim)
        .filter(|username| !username.is_empty())
}

fn roster_join_rule(record: &str, _ctx: &ClassifyContext<'_>) -> Option<ProtocolEvent> {
    username_before(record, JOINED_SUFFIX).map(|username| ProtocolEvent::RosterJoin {
        username: username.to_string(),
    })
}

fn voice_join_rule(record: &str, _ctx: &ClassifyContext<'_>) -> Option<ProtocolEvent> {
    username_before(record, VOICE_JOINED_SUFFIX).map(|username| ProtocolEvent::VoiceJoin {
        username: username.to_string(),
    })
}

fn voice_leave_rule(record: &str, _ctx: &ClassifyContext<'_>) -> Option<ProtocolEvent> {
    username_before(record, VOICE_LEFT_SUFFIX).map(|username| ProtocolEvent::VoiceLeave {
        username: username.to_string(),
    })
}

#[cfg(test)]
#[path = "tests/classifier_tests.rs"]
mod tests;
