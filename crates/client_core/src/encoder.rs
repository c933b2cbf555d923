//! Outbound commands to worker wire lines.

use shared::{
    domain::VoiceToggle,
    error::EncodeError,
    protocol::{
        OutboundCommand, EXIT_COMMAND, IMAGE_PREFIX, MAX_IMAGE_PAYLOAD_BYTES, VOICE_OFF_COMMAND,
        VOICE_ON_COMMAND,
    },
};

pub fn encode(cmd: &OutboundCommand) -> Result<Vec<u8>, EncodeError> {
    match cmd {
        OutboundCommand::SendText(text) => encode_text(text),
        OutboundCommand::SendImage { payload, total_len } => encode_image(payload, *total_len),
        OutboundCommand::VoiceToggle(VoiceToggle::On) => Ok(line(VOICE_ON_COMMAND.as_bytes())),
        OutboundCommand::VoiceToggle(VoiceToggle::Off) => Ok(line(VOICE_OFF_COMMAND.as_bytes())),
        OutboundCommand::Exit => Ok(line(EXIT_COMMAND.as_bytes())),
    }
}

fn encode_text(text: &str) -> Result<Vec<u8>, EncodeError> {
    if text.trim().is_empty() {
        return Err(EncodeError::EmptyMessage);
    }
    if has_line_break(text.as_bytes()) {
        return Err(EncodeError::EmbeddedNewline { field: "message text" });
    }
    Ok(line(text.as_bytes()))
}

/// The payload is opaque pre-encoded text; only its size and framing are checked.
fn encode_image(payload: &[u8], total_len: usize) -> Result<Vec<u8>, EncodeError> {
    if total_len != payload.len() {
        return Err(EncodeError::LengthMismatch {
            declared: total_len,
            actual: payload.len(),
        });
    }
    if payload.len() > MAX_IMAGE_PAYLOAD_BYTES {
        return Err(EncodeError::PayloadTooLarge {
            actual: payload.len(),
            limit: MAX_IMAGE_PAYLOAD_BYTES,
        });
    }
    if has_line_break(payload) {
        return Err(EncodeError::EmbeddedNewline {
            field: "image payload",
        });
    }

    let mut out = Vec::with_capacity(IMAGE_PREFIX.len() + payload.len() + 1);
    out.extend_from_slice(IMAGE_PREFIX.as_bytes());
    out.extend_from_slice(payload);
    out.push(b'\n');
    Ok(out)
}

fn has_line_break(bytes: &[u8]) -> bool {
    bytes.iter().any(|byte| matches!(byte, b'\n' | b'\r'))
}

fn line(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.extend_from_slice(body);
    out.push(b'\n');
    out
}

#[cfg(test)]
#[path = "tests/encoder_tests.rs"]
mod tests;
