//! Users known to be in the room, inferred from classified protocol events.

use std::sync::Arc;

use shared::{domain::RosterEntry, protocol::ProtocolEvent};
use tracing::debug;

use crate::avatar::{AvatarCache, NoAvatarCache};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    Inserted(String),
    VoiceChanged { username: String, in_voice: bool },
    Unchanged,
}

impl RosterChange {
    pub fn is_change(&self) -> bool {
        !matches!(self, RosterChange::Unchanged)
    }
}

/// Additive-only: the worker protocol has no "left the room" event, so
/// entries stay until the session ends and the whole roster is cleared.
pub struct RosterState {
    entries: Vec<RosterEntry>,
    avatars: Arc<dyn AvatarCache>,
}

impl Default for RosterState {
    fn default() -> Self {
        Self::new(Arc::new(NoAvatarCache))
    }
}

impl RosterState {
    pub fn new(avatars: Arc<dyn AvatarCache>) -> Self {
        Self {
            entries: Vec::new(),
            avatars,
        }
    }

    pub fn apply(&mut self, event: &ProtocolEvent) -> RosterChange {
        match event {
            ProtocolEvent::RosterJoin { username } => self.join(username),
            ProtocolEvent::VoiceJoin { username } => self.set_in_voice(username, true),
            ProtocolEvent::VoiceLeave { username } => self.set_in_voice(username, false),
            ProtocolEvent::ChatText { .. }
            | ProtocolEvent::Image { .. }
            | ProtocolEvent::Diagnostic { .. } => RosterChange::Unchanged,
        }
    }

    fn join(&mut self, username: &str) -> RosterChange {
        if self.get(username).is_some() {
            debug!(username, "roster join for known user ignored");
            return RosterChange::Unchanged;
        }
        let avatar = self.avatars.load(username);
        self.entries.push(RosterEntry::new(username, avatar));
        debug!(username, total = self.entries.len(), "roster user added");
        RosterChange::Inserted(username.to_string())
    }

    fn set_in_voice(&mut self, username: &str, in_voice: bool) -> RosterChange {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.username == username)
        else {
            debug!(username, in_voice, "voice change for unknown user ignored");
            return RosterChange::Unchanged;
        };
        if entry.in_voice == in_voice {
            return RosterChange::Unchanged;
        }
        entry.in_voice = in_voice;
        RosterChange::VoiceChanged {
            username: username.to_string(),
            in_voice,
        }
    }

    /// Updates the avatar of a present user. Returns whether an entry changed.
    pub fn set_avatar(&mut self, username: &str, avatar: Option<String>) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| entry.username == username)
        {
            Some(entry) if entry.avatar != avatar => {
                entry.avatar = avatar;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, username: &str) -> Option<&RosterEntry> {
        self.entries.iter().find(|entry| entry.username == username)
    }

    pub fn snapshot(&self) -> Vec<RosterEntry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
#[path = "tests/roster_tests.rs"]
mod tests;
