//! Newline framing over an arbitrarily chunked worker output stream.

const TERMINATOR: u8 = b'\n';

/// Holds the unterminated tail of a stream between reads.
///
/// Records are cut from raw bytes and decoded only once complete, so a
/// multi-byte character split across two chunks decodes correctly.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    pending: Vec<u8>,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and yields every record completed by it.
    ///
    /// The iterator is lazy; records it does not reach stay buffered and are
    /// produced by the next call. Consumed bytes are released when it drops.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        self.pending.extend_from_slice(chunk);
        Frames {
            pending: &mut self.pending,
            cursor: 0,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Removes and returns the unterminated tail, if any. Used at end of stream.
    pub fn take_partial(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

pub struct Frames<'a> {
    pending: &'a mut Vec<u8>,
    cursor: usize,
}

impl Iterator for Frames<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let rest = &self.pending[self.cursor..];
        let offset = rest.iter().position(|byte| *byte == TERMINATOR)?;
        let mut record = &rest[..offset];
        if let [head @ .., b'\r'] = record {
            record = head;
        }
        let decoded = String::from_utf8_lossy(record).into_owned();
        self.cursor += offset + 1;
        Some(decoded)
    }
}

impl Drop for Frames<'_> {
    fn drop(&mut self) {
        self.pending.drain(..self.cursor);
    }
}

#[cfg(test)]
#[path = "tests/framing_tests.rs"]
mod tests;
