use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);
    };
}

id_newtype!(HandleId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Server,
    Client,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Server => "server",
            ProcessKind::Client => "client",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    StoppingGraceful,
    StoppingForced,
    Stopped,
    Crashed,
}

impl ProcessState {
    /// Starting or Running: the kind is occupied and a new start reuses it.
    pub fn is_active(self) -> bool {
        matches!(self, ProcessState::Starting | ProcessState::Running)
    }

    pub fn is_stopping(self) -> bool {
        matches!(
            self,
            ProcessState::StoppingGraceful | ProcessState::StoppingForced
        )
    }
}

/// Snapshot of one supervised worker. The OS child itself never leaves the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub id: HandleId,
    pub kind: ProcessKind,
    pub state: ProcessState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub in_voice: bool,
}

impl RosterEntry {
    pub fn new(username: impl Into<String>, avatar: Option<String>) -> Self {
        Self {
            username: username.into(),
            avatar,
            in_voice: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceToggle {
    On,
    Off,
}

impl From<bool> for VoiceToggle {
    fn from(value: bool) -> Self {
        if value {
            VoiceToggle::On
        } else {
            VoiceToggle::Off
        }
    }
}
