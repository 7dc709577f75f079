//! Call status and the caller-visible error type.
//!
//! A [`Status`] travels as trailer metadata at end-of-stream; everything a
//! caller can observe going wrong is an [`RpcError`], which always maps to
//! one of the canonical [`StatusCode`]s.

use std::fmt;

use crate::metadata::{
    self, Metadata, escape_status_message, unescape_status_message,
};

/// Canonical status codes, wire-compatible with gRPC.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Convert from the wire integer. Unknown values map to `None`.
    pub fn from_u32(val: u32) -> Option<Self> {
        Some(match val {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Stable kebab-case name.
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid-argument",
            StatusCode::DeadlineExceeded => "deadline-exceeded",
            StatusCode::NotFound => "not-found",
            StatusCode::AlreadyExists => "already-exists",
            StatusCode::PermissionDenied => "permission-denied",
            StatusCode::ResourceExhausted => "resource-exhausted",
            StatusCode::FailedPrecondition => "failed-precondition",
            StatusCode::Aborted => "aborted",
            StatusCode::OutOfRange => "out-of-range",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
            StatusCode::DataLoss => "data-loss",
            StatusCode::Unauthenticated => "unauthenticated",
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u32())
    }
}

/// The terminal status of a stream: code, human-readable message, and
/// optional structured details.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    code: StatusCode,
    message: String,
    details: Option<serde_json::Value>,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn ok() -> Self {
        Status::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Status::new(StatusCode::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Status::new(StatusCode::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Status::new(StatusCode::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Status::new(StatusCode::FailedPrecondition, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Status::new(StatusCode::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unavailable, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.code.is_ok()
    }

    /// Render this status as trailer metadata.
    pub fn to_trailer(&self) -> Metadata {
        let mut md = Metadata::new().with(metadata::STATUS, self.code.as_u32().to_string());
        if !self.message.is_empty() {
            md.append(metadata::STATUS_MESSAGE, escape_status_message(&self.message));
        }
        if let Some(details) = &self.details {
            md.append(metadata::STATUS_DETAILS, details.to_string());
        }
        md
    }

    /// Extract a status from trailer metadata. `None` means the trailer
    /// carried no status header at all; the caller must treat that stream
    /// as incomplete.
    pub fn from_trailer(md: &Metadata) -> Option<Status> {
        let raw = md.get(metadata::STATUS)?;
        let code = raw
            .parse::<u32>()
            .ok()
            .and_then(StatusCode::from_u32)
            .unwrap_or(StatusCode::Unknown);
        let message = md
            .get(metadata::STATUS_MESSAGE)
            .map(unescape_status_message)
            .unwrap_or_default();
        let details = md
            .get(metadata::STATUS_DETAILS)
            .and_then(|raw| serde_json::from_str(raw).ok());
        Some(Status {
            code,
            message,
            details,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for Status {}

/// Transport-level failures, below the stream engine.
#[derive(Debug)]
pub enum TransportError {
    /// The transport was closed locally or by the peer.
    Closed,
    /// I/O failure on the underlying byte channel.
    Io(std::io::Error),
    /// The peer sent bytes that do not decode as a frame.
    Decode(String),
    /// A single frame could not fit the flow-control window cap.
    OverWindowCap(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed => write!(f, "transport closed"),
            TransportError::Io(e) => write!(f, "transport i/o error: {e}"),
            TransportError::Decode(msg) => write!(f, "transport decode error: {msg}"),
            TransportError::OverWindowCap(msg) => write!(f, "flow window cap exceeded: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e)
    }
}

/// Codec failures. Decode failures on the responder side become
/// `invalid-argument`; encode failures are always `internal`.
#[derive(Debug)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(msg) => write!(f, "encode error: {msg}"),
            CodecError::Decode(msg) => write!(f, "decode error: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// The single error type callers observe.
///
/// Every variant maps to a [`StatusCode`]; the mapping is total and stable.
#[derive(Debug)]
pub enum RpcError {
    /// The call terminated with a non-OK status (remote trailer or a local
    /// shape/deadline/cancellation failure).
    Status(Status),
    /// The transport failed underneath the call.
    Transport(TransportError),
    /// A payload failed to encode or decode.
    Codec(CodecError),
}

impl RpcError {
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        RpcError::Status(Status::new(code, message))
    }

    /// The status code this error maps to.
    pub fn code(&self) -> StatusCode {
        match self {
            RpcError::Status(status) => status.code(),
            RpcError::Transport(TransportError::OverWindowCap(_)) => StatusCode::ResourceExhausted,
            RpcError::Transport(_) => StatusCode::Unavailable,
            RpcError::Codec(CodecError::Decode(_)) => StatusCode::InvalidArgument,
            RpcError::Codec(CodecError::Encode(_)) => StatusCode::Internal,
        }
    }

    /// Collapse into a [`Status`] suitable for a trailer.
    pub fn to_status(&self) -> Status {
        match self {
            RpcError::Status(status) => status.clone(),
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcError::Status(status) => write!(f, "{status}"),
            RpcError::Transport(e) => write!(f, "{e}"),
            RpcError::Codec(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RpcError::Status(_) => None,
            RpcError::Transport(e) => Some(e),
            RpcError::Codec(e) => Some(e),
        }
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        RpcError::Status(status)
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        RpcError::Transport(e)
    }
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        RpcError::Codec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_values_are_wire_stable() {
        assert_eq!(StatusCode::Ok.as_u32(), 0);
        assert_eq!(StatusCode::Cancelled.as_u32(), 1);
        assert_eq!(StatusCode::InvalidArgument.as_u32(), 3);
        assert_eq!(StatusCode::DeadlineExceeded.as_u32(), 4);
        assert_eq!(StatusCode::NotFound.as_u32(), 5);
        assert_eq!(StatusCode::ResourceExhausted.as_u32(), 8);
        assert_eq!(StatusCode::FailedPrecondition.as_u32(), 9);
        assert_eq!(StatusCode::Unimplemented.as_u32(), 12);
        assert_eq!(StatusCode::Internal.as_u32(), 13);
        assert_eq!(StatusCode::Unavailable.as_u32(), 14);
        assert_eq!(StatusCode::Unauthenticated.as_u32(), 16);
    }

    #[test]
    fn code_roundtrip() {
        for val in 0..=16u32 {
            let code = StatusCode::from_u32(val).unwrap();
            assert_eq!(code.as_u32(), val);
        }
        assert_eq!(StatusCode::from_u32(17), None);
        assert_eq!(StatusCode::from_u32(999), None);
    }

    #[test]
    fn every_code_has_a_name() {
        for val in 0..=16u32 {
            let code = StatusCode::from_u32(val).unwrap();
            assert!(!code.name().is_empty());
        }
    }

    #[test]
    fn trailer_roundtrip() {
        let status = Status::new(StatusCode::NotFound, "no such peer: b%ta")
            .with_details(serde_json::json!({"peer": "b"}));
        let trailer = status.to_trailer();
        assert_eq!(trailer.get(crate::metadata::STATUS), Some("5"));

        let parsed = Status::from_trailer(&trailer).unwrap();
        assert_eq!(parsed.code(), StatusCode::NotFound);
        assert_eq!(parsed.message(), "no such peer: b%ta");
        assert_eq!(parsed.details(), Some(&serde_json::json!({"peer": "b"})));
    }

    #[test]
    fn ok_trailer_omits_message() {
        let trailer = Status::ok().to_trailer();
        assert_eq!(trailer.get(crate::metadata::STATUS), Some("0"));
        assert_eq!(trailer.get(crate::metadata::STATUS_MESSAGE), None);
        assert!(Status::from_trailer(&trailer).unwrap().is_ok());
    }

    #[test]
    fn missing_status_header_is_none() {
        let md = Metadata::new().with("content-type", "application/grpc+json");
        assert!(Status::from_trailer(&md).is_none());
    }

    #[test]
    fn unparseable_code_maps_to_unknown() {
        let md = Metadata::new().with(crate::metadata::STATUS, "banana");
        assert_eq!(
            Status::from_trailer(&md).unwrap().code(),
            StatusCode::Unknown
        );
    }

    #[test]
    fn error_code_mapping_is_total() {
        let e = RpcError::Transport(TransportError::Closed);
        assert_eq!(e.code(), StatusCode::Unavailable);
        let e = RpcError::Codec(CodecError::Decode("bad json".into()));
        assert_eq!(e.code(), StatusCode::InvalidArgument);
        let e = RpcError::Codec(CodecError::Encode("cycle".into()));
        assert_eq!(e.code(), StatusCode::Internal);
        let e = RpcError::status(StatusCode::Aborted, "raced");
        assert_eq!(e.code(), StatusCode::Aborted);
    }
}
