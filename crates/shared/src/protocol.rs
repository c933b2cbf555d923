use serde::{Deserialize, Serialize};

use crate::{
    domain::{ProcessKind, RosterEntry, VoiceToggle},
    error::BridgeFailure,
};

pub const DIAGNOSTIC_MARKER: &str = "[DEBUG]";
pub const IMAGE_PREFIX: &str = "IMAGE_DATA:";
pub const IMAGE_DELIMITER: &str = "]: IMAGE_DATA:";
pub const JOINED_SUFFIX: &str = " joined the chat";
pub const VOICE_JOINED_SUFFIX: &str = " подключился к голосовому чату";
pub const VOICE_LEFT_SUFFIX: &str = " отключился от голосового чата";

pub const VOICE_ON_COMMAND: &str = "/voice";
pub const VOICE_OFF_COMMAND: &str = "/leave";
pub const EXIT_COMMAND: &str = "/exit";

/// Hard ceiling on an inline image payload, checked before encoding.
pub const MAX_IMAGE_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

pub const ENV_SERVER_IP: &str = "SERVER_IP";
pub const ENV_USERNAME: &str = "USERNAME";

/// Tag the client worker prefixes to every line a user sends, e.g. `[alice]:`.
pub fn sender_tag(username: &str) -> String {
    format!("[{username}]:")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ProtocolEvent {
    ChatText { sender_is_self: bool, text: String },
    Image { sender_is_self: bool, payload: String },
    RosterJoin { username: String },
    VoiceJoin { username: String },
    VoiceLeave { username: String },
    Diagnostic { raw: String },
}

impl ProtocolEvent {
    pub fn is_diagnostic(&self) -> bool {
        matches!(self, ProtocolEvent::Diagnostic { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ProtocolEvent::ChatText { .. } => "chat_text",
            ProtocolEvent::Image { .. } => "image",
            ProtocolEvent::RosterJoin { .. } => "roster_join",
            ProtocolEvent::VoiceJoin { .. } => "voice_join",
            ProtocolEvent::VoiceLeave { .. } => "voice_leave",
            ProtocolEvent::Diagnostic { .. } => "diagnostic",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OutboundCommand {
    SendText(String),
    SendImage { payload: Vec<u8>, total_len: usize },
    VoiceToggle(VoiceToggle),
    Exit,
}

impl OutboundCommand {
    pub fn image(payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let total_len = payload.len();
        OutboundCommand::SendImage { payload, total_len }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundCommand::SendText(_) => "send_text",
            OutboundCommand::SendImage { .. } => "send_image",
            OutboundCommand::VoiceToggle(_) => "voice_toggle",
            OutboundCommand::Exit => "exit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyVia {
    Marker,
    SettleDelay,
    Spawned,
}

/// Everything the bridge forwards to the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UiEvent {
    Protocol(ProtocolEvent),
    RosterUpdated(Vec<RosterEntry>),
    SessionStarted {
        username: String,
    },
    ProcessReady {
        kind: ProcessKind,
        via: ReadyVia,
    },
    VoiceStateChanged(bool),
    ImageSent,
    SendFailed(BridgeFailure),
    StartFailed {
        kind: ProcessKind,
        failure: BridgeFailure,
    },
    ProcessCrashed {
        kind: ProcessKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    ProcessStopped {
        kind: ProcessKind,
        forced: bool,
    },
    LoggedOut,
    Info(String),
}
