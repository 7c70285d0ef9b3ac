//! Length-prefixed JSON framing.
//!
//! Every message on the wire is `u32 big-endian body length || JSON body`.
//! The length prefix is authoritative: a body that fails to parse never
//! desynchronizes the stream, it is dropped and decoding continues at the
//! next frame boundary. A length above [`MAX_FRAME_SIZE`] is fatal to the
//! connection.

use super::envelope::Envelope;
use crate::log_warn;

/// Hard cap on a single frame body (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Bytes in the length prefix.
pub const HEADER_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    Oversize { size: usize, max: usize },
    #[error("failed to serialize envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Serialize an envelope into a single frame ready for the socket.
pub fn encode(env: &Envelope) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(env)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::Oversize {
            size: body.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Incremental frame decoder over a growing byte buffer.
///
/// Feed raw socket reads with [`FrameDecoder::extend`], then drain decoded
/// envelopes with [`FrameDecoder::next_envelope`] until it returns
/// `Ok(None)`.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder { buf: Vec::new() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete frame, if the buffer holds one.
    ///
    /// `Ok(None)` means more bytes are needed. `Err` is returned only for an
    /// oversize length prefix, which must fail the connection.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, FrameError> {
        loop {
            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }
            let len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(FrameError::Oversize {
                    size: len,
                    max: MAX_FRAME_SIZE,
                });
            }
            if self.buf.len() < HEADER_LEN + len {
                return Ok(None);
            }
            let body: Vec<u8> = self.buf.drain(..HEADER_LEN + len).skip(HEADER_LEN).collect();
            match serde_json::from_slice::<Envelope>(&body) {
                Ok(env) => return Ok(Some(env)),
                Err(e) => {
                    // Frame-aligned skip; the next length prefix is intact.
                    log_warn!("FRAME", "dropping malformed frame body: {e}");
                    continue;
                }
            }
        }
    }
}
