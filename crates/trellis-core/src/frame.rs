//! The frame model carried by every transport.
//!
//! A frame belongs to exactly one stream. Metadata frames carry header
//! lists (initial headers and trailers), message frames carry one
//! length-delimited payload, and the bare end marker closes a send half
//! without carrying anything.

use bytes::Bytes;

use crate::metadata::Metadata;
use crate::status::Status;

/// What a frame carries.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// A header list: initial request/response headers, or a trailer when
    /// `end_stream` is set.
    Metadata(Metadata),
    /// One message payload.
    Message(Bytes),
    /// End-of-stream marker with no payload (client-streaming `finish`).
    End,
}

/// A single protocol frame. The stream id is fixed at construction and
/// never rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    stream_id: u32,
    end_stream: bool,
    body: FrameBody,
}

impl Frame {
    /// A metadata frame. With `end_stream` set this is a trailer.
    pub fn metadata_frame(stream_id: u32, metadata: Metadata, end_stream: bool) -> Self {
        debug_assert!(stream_id != 0, "stream ids are positive");
        Frame {
            stream_id,
            end_stream,
            body: FrameBody::Metadata(metadata),
        }
    }

    /// Initial headers opening a call, or response headers from the
    /// responder.
    pub fn headers(stream_id: u32, metadata: Metadata) -> Self {
        Frame::metadata_frame(stream_id, metadata, false)
    }

    /// One message payload.
    pub fn message(stream_id: u32, payload: Bytes, end_stream: bool) -> Self {
        debug_assert!(stream_id != 0, "stream ids are positive");
        Frame {
            stream_id,
            end_stream,
            body: FrameBody::Message(payload),
        }
    }

    /// Half-close without payload.
    pub fn end(stream_id: u32) -> Self {
        Frame {
            stream_id,
            end_stream: true,
            body: FrameBody::End,
        }
    }

    /// Terminal trailer carrying a status. Always ends the stream.
    pub fn trailer(stream_id: u32, status: &Status) -> Self {
        Frame::metadata_frame(stream_id, status.to_trailer(), true)
    }

    /// Reset marker: a cancelled trailer from the caller side.
    pub fn reset(stream_id: u32) -> Self {
        Frame::trailer(stream_id, &Status::cancelled("call cancelled by caller"))
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn end_stream(&self) -> bool {
        self.end_stream
    }

    pub fn body(&self) -> &FrameBody {
        &self.body
    }

    pub fn into_body(self) -> FrameBody {
        self.body
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self.body, FrameBody::Metadata(_))
    }

    pub fn is_message(&self) -> bool {
        matches!(self.body, FrameBody::Message(_))
    }

    /// Metadata payload, if this is a metadata frame.
    pub fn metadata(&self) -> Option<&Metadata> {
        match &self.body {
            FrameBody::Metadata(md) => Some(md),
            _ => None,
        }
    }

    /// Message payload, if this is a message frame.
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            FrameBody::Message(payload) => Some(payload),
            _ => None,
        }
    }

    /// Trailer status, if this is a metadata frame with `end_stream` that
    /// carries a status header.
    pub fn trailer_status(&self) -> Option<Status> {
        if !self.end_stream {
            return None;
        }
        Status::from_trailer(self.metadata()?)
    }

    /// Bytes of payload this frame counts against the flow window.
    pub fn flow_weight(&self) -> usize {
        match &self.body {
            FrameBody::Message(payload) => payload.len(),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn trailer_status_requires_end_stream() {
        let status = Status::new(StatusCode::Ok, "");
        let frame = Frame::headers(1, status.to_trailer());
        assert!(frame.trailer_status().is_none());

        let frame = Frame::trailer(1, &status);
        assert_eq!(frame.trailer_status().unwrap().code(), StatusCode::Ok);
    }

    #[test]
    fn reset_is_a_cancelled_trailer() {
        let frame = Frame::reset(7);
        assert!(frame.end_stream());
        assert_eq!(
            frame.trailer_status().unwrap().code(),
            StatusCode::Cancelled
        );
    }

    #[test]
    fn only_messages_weigh_on_the_flow_window() {
        assert_eq!(Frame::message(1, Bytes::from(vec![0; 42]), false).flow_weight(), 42);
        assert_eq!(Frame::end(1).flow_weight(), 0);
        assert_eq!(Frame::headers(1, Metadata::new()).flow_weight(), 0);
    }
}
