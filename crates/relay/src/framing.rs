//! Native-messaging frame codec: 4-byte little-endian length prefix followed
//! by a UTF-8 JSON body.
//!
//! The decoder is incremental. Bytes arrive in whatever chunks the pipe
//! delivers; the decoder first collects the 4-byte prefix, then exactly
//! `len` body bytes, emits the parsed message and resets for the next
//! prefix. A body that fails JSON parse is connection-fatal: past that
//! point the stream offers no unambiguous way to find the next prefix, so
//! the decoder never scans for one.

use serde::Serialize;
use serde_json::Value;

use tabpilot_core::{Error, Result};

const LENGTH_PREFIX_BYTES: usize = 4;

/// Encode one message as a length-prefixed frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame decoder.
///
/// The codec itself enforces no maximum length; callers that want a sanity
/// cap layer one via [`FrameDecoder::with_max_frame_bytes`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes: Some(max_frame_bytes),
        }
    }

    /// Feed a chunk of bytes into the decoder. Chunk boundaries carry no
    /// meaning; a frame may span many chunks and a chunk may hold many
    /// frames.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Try to decode the next complete frame. `Ok(None)` means more bytes
    /// are needed. Errors are connection-fatal for the stream that produced
    /// the bytes.
    pub fn next_frame(&mut self) -> Result<Option<Value>> {
        if self.buf.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }
        let body_len =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if let Some(max) = self.max_frame_bytes {
            if body_len > max {
                return Err(Error::Framing(format!(
                    "frame length {body_len} exceeds cap of {max} bytes"
                )));
            }
        }
        if self.buf.len() < LENGTH_PREFIX_BYTES + body_len {
            return Ok(None);
        }
        let body = self.buf[LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + body_len].to_vec();
        self.buf.drain(..LENGTH_PREFIX_BYTES + body_len);
        let message = serde_json::from_slice(&body)
            .map_err(|e| Error::Framing(format!("invalid JSON frame body: {e}")))?;
        Ok(Some(message))
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}
