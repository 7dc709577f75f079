//! Pluggable byte↔value codecs.
//!
//! The engine never interprets payload bytes; a [`Codec`] at each end of a
//! call turns typed values into bytes and back. The bundled [`JsonCodec`]
//! covers anything serde can handle; [`RawCodec`] passes bytes through
//! untouched for callers that frame their own payloads.

use std::marker::PhantomData;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::status::CodecError;

/// A pure byte↔value converter. Must round-trip every value the service
/// accepts.
pub trait Codec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Content type advertised in initial call metadata.
    fn content_type(&self) -> &'static str {
        crate::metadata::CONTENT_TYPE_JSON
    }
}

/// JSON codec over serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        JsonCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        JsonCodec::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Shorthand for a JSON codec of `T`.
pub fn json<T>() -> JsonCodec<T> {
    JsonCodec::new()
}

/// Identity codec over raw bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(bytes))
    }

    fn content_type(&self) -> &'static str {
        "application/grpc+raw"
    }
}

/// A single boxed primitive, for services whose payloads are scalars
/// rather than structs. Carried inside the generic payload; no wrapper
/// type per primitive.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum PrimitiveValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_codec_roundtrip() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Req {
            n: u32,
            tags: Vec<String>,
        }

        let codec = json::<Req>();
        let value = Req {
            n: 3,
            tags: vec!["a".into(), "b".into()],
        };
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn json_decode_failure_is_decode_error() {
        let codec = json::<u32>();
        let err = codec.decode(b"not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn raw_codec_is_identity() {
        let codec = RawCodec;
        let payload = Bytes::from_static(&[0x01, 0x02, 0x03]);
        let encoded = codec.encode(&payload).unwrap();
        assert_eq!(encoded, payload);
        assert_eq!(codec.decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn primitive_value_roundtrip() {
        let values = [
            PrimitiveValue::Null,
            PrimitiveValue::Bool(true),
            PrimitiveValue::Int(-42),
            PrimitiveValue::Float(2.5),
            PrimitiveValue::String("hi".into()),
            PrimitiveValue::Bytes(vec![0, 1, 254, 255]),
        ];
        let codec = json::<PrimitiveValue>();
        for value in values {
            let bytes = codec.encode(&value).unwrap();
            assert_eq!(codec.decode(&bytes).unwrap(), value);
        }
    }
}
