use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SpawnFailed,
    WriteAfterExit,
    PayloadTooLarge,
    InvalidCommand,
    WriteFailed,
    Crashed,
}

/// UI-facing description of a failed bridge operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl BridgeFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("image payload of {actual} bytes exceeds the {limit} byte ceiling")]
    PayloadTooLarge { actual: usize, limit: usize },
    #[error("{field} must fit on a single line")]
    EmbeddedNewline { field: &'static str },
    #[error("message text must not be empty")]
    EmptyMessage,
    #[error("declared image length {declared} does not match payload length {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

impl EncodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EncodeError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            EncodeError::EmbeddedNewline { .. }
            | EncodeError::EmptyMessage
            | EncodeError::LengthMismatch { .. } => ErrorCode::InvalidCommand,
        }
    }
}

impl From<EncodeError> for BridgeFailure {
    fn from(value: EncodeError) -> Self {
        Self {
            code: value.code(),
            message: value.to_string(),
        }
    }
}
