//! Length-prefixed message framing.
//!
//! Every message payload travels as `[flags:1][length:4 BE][payload]`.
//! Flag bit 0 is reserved for compression; this engine never sets it and
//! rejects it on receipt since no decompressor is wired in. Decoding is
//! restartable: a short buffer leaves the input untouched and reports how
//! many more bytes are needed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::status::{Status, StatusCode};

/// Size of the message frame header.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// Flag bit 0: payload is compressed. Never produced here.
pub const FLAG_COMPRESSED: u8 = 0b0000_0001;

/// Default per-message byte cap (4 MiB). Endpoint configuration may
/// override it; the same value governs encode, decode, and the engine's
/// send path.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Errors from the message framing layer. Each maps onto a stream status:
/// senders fail with `resource-exhausted`, readers with `invalid-argument`.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Sender-side: payload exceeds the configured cap.
    MessageTooLarge { len: usize, max: usize },
    /// Reader-side: the length prefix exceeds the configured cap.
    LengthOverCap { len: usize, max: usize },
    /// Reader-side: unknown flag bits were set.
    UnsupportedFlags(u8),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::MessageTooLarge { len, max } => {
                write!(f, "message of {len} bytes exceeds cap of {max}")
            }
            FrameError::LengthOverCap { len, max } => {
                write!(f, "frame announces {len} bytes, cap is {max}")
            }
            FrameError::UnsupportedFlags(flags) => {
                write!(f, "unsupported frame flags {flags:#04x}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl FrameError {
    /// The stream status this framing failure terminates with.
    pub fn to_status(&self) -> Status {
        match self {
            FrameError::MessageTooLarge { .. } => {
                Status::new(StatusCode::ResourceExhausted, self.to_string())
            }
            FrameError::LengthOverCap { .. } | FrameError::UnsupportedFlags(_) => {
                Status::new(StatusCode::InvalidArgument, self.to_string())
            }
        }
    }
}

/// Encode one message into its framed form.
pub fn encode_message(payload: &[u8], max_message_bytes: usize) -> Result<Bytes, FrameError> {
    if payload.len() > max_message_bytes {
        return Err(FrameError::MessageTooLarge {
            len: payload.len(),
            max: max_message_bytes,
        });
    }
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Outcome of one decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete message payload was consumed from the buffer.
    Message(Bytes),
    /// The buffer holds a partial frame; nothing was consumed. At least
    /// this many further bytes are required to make progress.
    NeedMore(usize),
}

/// Restartable decoder over an externally-owned buffer.
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    max_message_bytes: usize,
}

impl MessageDecoder {
    pub fn new(max_message_bytes: usize) -> Self {
        MessageDecoder { max_message_bytes }
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Try to decode one message from the front of `buf`.
    ///
    /// On `NeedMore` the buffer is left exactly as it was. Errors are
    /// fatal to the stream; the caller must not retry with the same bytes.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Decoded, FrameError> {
        if buf.len() < MESSAGE_HEADER_LEN {
            return Ok(Decoded::NeedMore(MESSAGE_HEADER_LEN - buf.len()));
        }

        let flags = buf[0];
        if flags != 0 {
            return Err(FrameError::UnsupportedFlags(flags));
        }

        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len > self.max_message_bytes {
            return Err(FrameError::LengthOverCap {
                len,
                max: self.max_message_bytes,
            });
        }

        if buf.len() < MESSAGE_HEADER_LEN + len {
            return Ok(Decoded::NeedMore(MESSAGE_HEADER_LEN + len - buf.len()));
        }

        buf.advance(MESSAGE_HEADER_LEN);
        Ok(Decoded::Message(buf.split_to(len).freeze()))
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        MessageDecoder::new(DEFAULT_MAX_MESSAGE_BYTES)
    }
}
