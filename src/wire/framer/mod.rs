//! Splits a TCP byte stream into codec frames.
//!
//! The control channel has no transport-level message boundaries, so the
//! accumulator buffers incoming bytes and cuts frames using the header size
//! field. Bytes that do not start with the sync sequence are dropped up to the
//! next candidate sync position.

use crate::wire::codec::{
    check_declared_size, FrameError, HEADER_SIZE_BYTES, MAX_FRAME_SIZE_BYTES, SYNC_BYTES,
};

#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_SIZE_BYTES)
    }
}

impl FrameAccumulator {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    #[cfg(test)]
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Appends received bytes. Exceeding the limit drops everything buffered so
    /// far, since no complete frame can be recovered from it.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let buffered = self.buffer.len().saturating_add(bytes.len());
        if buffered > self.limit {
            self.buffer.clear();
            return Err(FrameError::BufferOverflow {
                buffered,
                limit: self.limit,
            });
        }

        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Returns the next complete frame, an error describing bytes that were
    /// discarded, or `None` when more input is needed.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, FrameError>> {
        if self.buffer.is_empty() {
            return None;
        }

        let start = sync_start(&self.buffer).unwrap_or(self.buffer.len());
        if start > 0 {
            let found = leading_bytes(&self.buffer);
            self.buffer.drain(..start);
            return Some(Err(FrameError::SyncMismatch { found }));
        }

        if self.buffer.len() < HEADER_SIZE_BYTES {
            return None;
        }

        let declared = u32::from_le_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;
        if let Err(error) = check_declared_size(declared) {
            self.buffer.drain(..1);
            return Some(Err(error));
        }
        if declared > self.limit {
            self.buffer.drain(..1);
            return Some(Err(FrameError::FrameTooLarge {
                declared,
                limit: self.limit,
            }));
        }

        if self.buffer.len() < declared {
            return None;
        }

        Some(Ok(self.buffer.drain(..declared).collect()))
    }
}

fn sync_start(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len()).find(|&index| {
        let tail = &buffer[index..];
        let len = tail.len().min(SYNC_BYTES.len());
        tail[..len] == SYNC_BYTES[..len]
    })
}

fn leading_bytes(buffer: &[u8]) -> [u8; 4] {
    let mut found = [0_u8; 4];
    let len = buffer.len().min(found.len());
    found[..len].copy_from_slice(&buffer[..len]);
    found
}
