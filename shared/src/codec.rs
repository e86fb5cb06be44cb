//! Length-prefixed framing for the management channel
//!
//! ```text
//! [ u32 big-endian body length ][ protobuf Envelope ]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;

use crate::Envelope;

/// Upper bound for a single frame body (10 MiB)
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

const PREFIX_LEN: usize = std::mem::size_of::<u32>();

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("envelope of {0} bytes exceeds the {MAX_FRAME_LEN} byte frame limit")]
    FrameTooLarge(usize),

    #[error("peer announced a {0} byte frame, limit is {MAX_FRAME_LEN}")]
    InvalidLength(u32),

    #[error("malformed envelope: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Serialize `envelope` as one complete frame
pub fn encode(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let body_len = envelope.encoded_len();
    let announced = u32::try_from(body_len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(CodecError::FrameTooLarge(body_len))?;

    let mut frame = BytesMut::with_capacity(PREFIX_LEN + body_len);
    frame.put_u32(announced);
    envelope.encode(&mut frame)?;
    Ok(frame.freeze())
}

/// Reassembles envelopes from arbitrarily chunked stream reads.
///
/// Once a prefix has been read the announced length is remembered, so a
/// large frame arriving in many reads is not re-parsed on every call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: BytesMut,
    body_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            pending: BytesMut::with_capacity(4096),
            body_len: None,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Next complete envelope, or `None` until more bytes arrive
    pub fn decode_next(&mut self) -> Result<Option<Envelope>, CodecError> {
        let body_len = match self.body_len {
            Some(len) => len,
            None => {
                if self.pending.len() < PREFIX_LEN {
                    return Ok(None);
                }
                let announced = self.pending.get_u32();
                if announced > MAX_FRAME_LEN {
                    return Err(CodecError::InvalidLength(announced));
                }
                *self.body_len.insert(announced as usize)
            }
        };

        if self.pending.len() < body_len {
            self.pending.reserve(body_len - self.pending.len());
            return Ok(None);
        }

        self.body_len = None;
        let body = self.pending.split_to(body_len).freeze();
        Ok(Some(Envelope::decode(body)?))
    }

    /// Every envelope that is complete so far.
    ///
    /// An error leaves the stream unusable; drop the connection.
    pub fn decode_all(&mut self) -> Result<Vec<Envelope>, CodecError> {
        std::iter::from_fn(|| self.decode_next().transpose()).collect()
    }

    /// Bytes held that do not yet form a frame, prefix included
    pub fn buffered(&self) -> usize {
        self.pending.len() + self.body_len.map_or(0, |_| PREFIX_LEN)
    }
}
