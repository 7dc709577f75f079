//! Framed transport over any `AsyncRead + AsyncWrite` byte stream.
//!
//! Wire layout per frame:
//!
//! ```text
//! [kind:1][stream_id:4 BE][end:1] body
//!   kind 0 (metadata): [count:2 BE] { [name_len:2 BE][name][value_len:4 BE][value] }*
//!   kind 1 (message):  [flags:1][length:4 BE][payload]
//!   kind 2 (end):      (empty)
//! ```
//!
//! Message bodies reuse the 5-byte framing from [`crate::framing`], so a
//! reader on the other end of a socket sees exactly the length-prefixed
//! format the engine promises.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::frame::{Frame, FrameBody};
use crate::framing::{self, DEFAULT_MAX_MESSAGE_BYTES};
use crate::metadata::Metadata;
use crate::status::TransportError;
use crate::transport::{Side, TransportBackend};

const KIND_METADATA: u8 = 0;
const KIND_MESSAGE: u8 = 1;
const KIND_END: u8 = 2;

/// Upper bound on headers per metadata frame.
const MAX_HEADERS: usize = 256;

/// Upper bound on a single header name.
const MAX_NAME_LEN: usize = 1024;

/// Upper bound on a single header value.
const MAX_VALUE_LEN: usize = 16 * 1024;

/// Serialize a frame into its wire form.
pub fn encode_frame(frame: &Frame, max_message_bytes: usize) -> Result<Bytes, TransportError> {
    let mut buf = BytesMut::with_capacity(16 + frame.flow_weight());
    match frame.body() {
        FrameBody::Metadata(_) => buf.put_u8(KIND_METADATA),
        FrameBody::Message(_) => buf.put_u8(KIND_MESSAGE),
        FrameBody::End => buf.put_u8(KIND_END),
    }
    buf.put_u32(frame.stream_id());
    buf.put_u8(frame.end_stream() as u8);

    match frame.body() {
        FrameBody::Metadata(md) => {
            if md.len() > MAX_HEADERS {
                return Err(TransportError::Decode(format!(
                    "metadata frame with {} headers exceeds limit of {MAX_HEADERS}",
                    md.len()
                )));
            }
            buf.put_u16(md.len() as u16);
            for header in md.iter() {
                buf.put_u16(header.name().len() as u16);
                buf.put_slice(header.name().as_bytes());
                buf.put_u32(header.value().len() as u32);
                buf.put_slice(header.value().as_bytes());
            }
        }
        FrameBody::Message(payload) => {
            let framed = framing::encode_message(payload, max_message_bytes)
                .map_err(|e| TransportError::Decode(e.to_string()))?;
            buf.put_slice(&framed);
        }
        FrameBody::End => {}
    }
    Ok(buf.freeze())
}

/// Parse one wire frame. The input must contain exactly one frame.
pub fn decode_frame(data: &[u8], max_message_bytes: usize) -> Result<Frame, TransportError> {
    let mut buf = BytesMut::from(data);
    if buf.len() < 6 {
        return Err(TransportError::Decode("truncated frame header".into()));
    }
    let kind = buf.get_u8();
    let stream_id = buf.get_u32();
    if stream_id == 0 {
        return Err(TransportError::Decode("frame with stream id 0".into()));
    }
    let end_stream = match buf.get_u8() {
        0 => false,
        1 => true,
        other => {
            return Err(TransportError::Decode(format!(
                "invalid end-stream byte {other}"
            )));
        }
    };

    match kind {
        KIND_METADATA => {
            let md = decode_metadata(&mut buf)?;
            Ok(Frame::metadata_frame(stream_id, md, end_stream))
        }
        KIND_MESSAGE => {
            let decoder = framing::MessageDecoder::new(max_message_bytes);
            match decoder.decode(&mut buf) {
                Ok(framing::Decoded::Message(payload)) => {
                    Ok(Frame::message(stream_id, payload, end_stream))
                }
                Ok(framing::Decoded::NeedMore(_)) => {
                    Err(TransportError::Decode("truncated message body".into()))
                }
                Err(e) => Err(TransportError::Decode(e.to_string())),
            }
        }
        KIND_END => Ok(Frame::end(stream_id)),
        other => Err(TransportError::Decode(format!("unknown frame kind {other}"))),
    }
}

fn decode_metadata(buf: &mut BytesMut) -> Result<Metadata, TransportError> {
    if buf.len() < 2 {
        return Err(TransportError::Decode("truncated metadata frame".into()));
    }
    let count = buf.get_u16() as usize;
    if count > MAX_HEADERS {
        return Err(TransportError::Decode(format!(
            "metadata frame with {count} headers exceeds limit of {MAX_HEADERS}"
        )));
    }
    let mut md = Metadata::new();
    for _ in 0..count {
        let name = read_chunk(buf, ChunkLen::U16, MAX_NAME_LEN)?;
        let value = read_chunk(buf, ChunkLen::U32, MAX_VALUE_LEN)?;
        md.append(name, value);
    }
    Ok(md)
}

enum ChunkLen {
    U16,
    U32,
}

fn read_chunk(buf: &mut BytesMut, len_kind: ChunkLen, max: usize) -> Result<String, TransportError> {
    let len = match len_kind {
        ChunkLen::U16 => {
            if buf.len() < 2 {
                return Err(TransportError::Decode("truncated header length".into()));
            }
            buf.get_u16() as usize
        }
        ChunkLen::U32 => {
            if buf.len() < 4 {
                return Err(TransportError::Decode("truncated header length".into()));
            }
            buf.get_u32() as usize
        }
    };
    if len > max {
        return Err(TransportError::Decode(format!(
            "header chunk of {len} bytes exceeds limit of {max}"
        )));
    }
    if buf.len() < len {
        return Err(TransportError::Decode("truncated header bytes".into()));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| TransportError::Decode("header bytes are not utf-8".into()))
}

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("side", &self.inner.side)
            .finish_non_exhaustive()
    }
}

struct StreamInner {
    side: Side,
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
    max_message_bytes: AtomicUsize,
}

impl StreamTransport {
    pub fn new<S>(io: S, side: Side) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        StreamTransport {
            inner: Arc::new(StreamInner {
                side,
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
                max_message_bytes: AtomicUsize::new(DEFAULT_MAX_MESSAGE_BYTES),
            }),
        }
    }

    /// Paired transports over an in-memory duplex pipe: (initiator,
    /// acceptor). Useful in tests exercising the wire encoding.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (
            StreamTransport::new(a, Side::Initiator),
            StreamTransport::new(b, Side::Acceptor),
        )
    }

    /// Align the transport's message cap with the endpoint configuration.
    pub fn set_max_message_bytes(&self, max: usize) {
        self.inner.max_message_bytes.store(max, Ordering::Release);
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for StreamTransport {
    fn side(&self) -> Side {
        self.inner.side
    }

    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        let max = self.inner.max_message_bytes.load(Ordering::Acquire);
        let wire = encode_frame(&frame, max)?;

        let mut writer = self.inner.writer.lock().await;
        writer.write_u32(wire.len() as u32).await?;
        writer.write_all(&wire).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Frame>, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }
        let max = self.inner.max_message_bytes.load(Ordering::Acquire);

        let mut reader = self.inner.reader.lock().await;
        let frame_len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Clean close before the next frame header.
                return Ok(None);
            }
            Err(e) => return Err(TransportError::Io(e)),
        };

        // Header + body can never legitimately exceed the message cap plus
        // framing and metadata overhead.
        let hard_limit = max + framing::MESSAGE_HEADER_LEN + 6 + MAX_HEADERS * (MAX_NAME_LEN + MAX_VALUE_LEN + 6);
        if frame_len > hard_limit {
            return Err(TransportError::Decode(format!(
                "wire frame of {frame_len} bytes exceeds limit"
            )));
        }

        let mut wire = vec![0u8; frame_len];
        reader.read_exact(&mut wire).await?;
        drop(reader);

        decode_frame(&wire, max).map(Some)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    #[test]
    fn wire_roundtrip_metadata() {
        let md = Metadata::new()
            .with(":path", "/EchoService/Echo")
            .with("content-type", "application/grpc+json")
            .with("x-custom", "v");
        let frame = Frame::headers(7, md.clone());
        let wire = encode_frame(&frame, 1024).unwrap();
        let back = decode_frame(&wire, 1024).unwrap();
        assert_eq!(back.stream_id(), 7);
        assert!(!back.end_stream());
        assert_eq!(back.metadata().unwrap(), &md);
    }

    #[test]
    fn wire_roundtrip_trailer_keeps_end_flag() {
        let frame = Frame::trailer(9, &Status::ok());
        let wire = encode_frame(&frame, 1024).unwrap();
        let back = decode_frame(&wire, 1024).unwrap();
        assert!(back.end_stream());
        assert!(back.trailer_status().unwrap().is_ok());
    }

    #[test]
    fn wire_roundtrip_message_and_end() {
        let frame = Frame::message(3, Bytes::from_static(b"\x01\x02\x03"), true);
        let wire = encode_frame(&frame, 1024).unwrap();
        let back = decode_frame(&wire, 1024).unwrap();
        assert_eq!(back.payload().unwrap().as_ref(), b"\x01\x02\x03");
        assert!(back.end_stream());

        let frame = Frame::end(4);
        let back = decode_frame(&encode_frame(&frame, 1024).unwrap(), 1024).unwrap();
        assert!(matches!(back.body(), FrameBody::End));
        assert!(back.end_stream());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_frame(&[], 1024).is_err());
        assert!(decode_frame(&[9, 0, 0, 0, 1, 0], 1024).is_err()); // unknown kind
        assert!(decode_frame(&[0, 0, 0, 0, 0, 0, 0, 0], 1024).is_err()); // stream id 0
    }

    #[tokio::test]
    async fn transport_pair_carries_frames() {
        let (a, b) = StreamTransport::pair();
        assert_eq!(a.side(), Side::Initiator);
        assert_eq!(b.side(), Side::Acceptor);

        a.send(Frame::message(1, Bytes::from_static(b"over the wire"), false))
            .await
            .unwrap();
        let frame = b.recv().await.unwrap().unwrap();
        assert_eq!(frame.payload().unwrap().as_ref(), b"over the wire");
    }

    #[tokio::test]
    async fn dropping_writer_side_ends_input_cleanly() {
        let (a, b) = StreamTransport::pair();
        a.send(Frame::end(1)).await.unwrap();
        drop(a);
        assert!(b.recv().await.unwrap().is_some());
        assert!(b.recv().await.unwrap().is_none());
    }
}
