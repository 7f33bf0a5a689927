use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::error::{DecodeError, EncodeError};

/// An encoded message body and the content type describing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

/// A serialization strategy for message payloads.
///
/// Codecs are stateless. The caller picks one explicitly on both sides;
/// the content type is informational and never used to choose a decoder.
pub trait Codec: Copy + Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Encoded, EncodeError>;

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DecodeError>;
}

/// Human-readable JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Json;

impl Json {
    pub const CONTENT_TYPE: &'static str = "application/json";
}

impl Codec for Json {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Encoded, EncodeError> {
        Ok(Encoded {
            body: serde_json::to_vec(value)?,
            content_type: Self::CONTENT_TYPE,
        })
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Compact binary encoding via `bincode`'s serde bridge, standard config.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bincode;

impl Bincode {
    pub const CONTENT_TYPE: &'static str = "application/octet-stream";
}

impl Codec for Bincode {
    fn content_type(&self) -> &'static str {
        Self::CONTENT_TYPE
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Encoded, EncodeError> {
        let body = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        Ok(Encoded {
            body,
            content_type: Self::CONTENT_TYPE,
        })
    }

    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, DecodeError> {
        let (value, consumed) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())?;
        if consumed != body.len() {
            return Err(DecodeError::TrailingBytes {
                consumed,
                trailing: body.len() - consumed,
            });
        }
        Ok(value)
    }
}
