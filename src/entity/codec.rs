use crate::core::{ConcurrencyKey, EntityError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CodecError(pub String);

impl From<CodecError> for EntityError {
    fn from(err: CodecError) -> Self {
        EntityError::Codec(err.0)
    }
}

/// Translates an entity's messages and responses to and from raw bytes.
pub trait MessageCodec<M, R>: Send + Sync {
    fn encode_message(&self, message: &M) -> Result<Vec<u8>, CodecError>;

    fn decode_message(&self, payload: &[u8]) -> Result<M, CodecError>;

    fn encode_response(&self, response: &R) -> Result<Vec<u8>, CodecError>;

    fn decode_response(&self, payload: &[u8]) -> Result<R, CodecError>;

    /// Decodes a chunk streamed by the active while synchronizing `key`.
    fn decode_sync_message(
        &self,
        _key: ConcurrencyKey,
        payload: &[u8],
    ) -> Result<M, CodecError> {
        self.decode_message(payload)
    }
}

/// MessagePack codec for any serde message/response pair.
pub struct SerdeCodec<M, R> {
    _marker: PhantomData<fn() -> (M, R)>,
}

impl<M, R> SerdeCodec<M, R> {
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M, R> Default for SerdeCodec<M, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M, R> MessageCodec<M, R> for SerdeCodec<M, R>
where
    M: Serialize + DeserializeOwned,
    R: Serialize + DeserializeOwned,
{
    fn encode_message(&self, message: &M) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec(message)
            .map_err(|e| CodecError(format!("Failed to encode message: {}", e)))
    }

    fn decode_message(&self, payload: &[u8]) -> Result<M, CodecError> {
        rmp_serde::from_slice(payload)
            .map_err(|e| CodecError(format!("Failed to decode message: {}", e)))
    }

    fn encode_response(&self, response: &R) -> Result<Vec<u8>, CodecError> {
        rmp_serde::to_vec(response)
            .map_err(|e| CodecError(format!("Failed to encode response: {}", e)))
    }

    fn decode_response(&self, payload: &[u8]) -> Result<R, CodecError> {
        rmp_serde::from_slice(payload)
            .map_err(|e| CodecError(format!("Failed to decode response: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    enum Op {
        Put(String, i64),
        Get(String),
    }

    #[test]
    fn test_serde_codec_messages() {
        let codec: SerdeCodec<Op, Option<i64>> = SerdeCodec::new();
        let bytes = codec.encode_message(&Op::Put("k".into(), 4)).unwrap();
        assert_eq!(codec.decode_message(&bytes).unwrap(), Op::Put("k".into(), 4));
        assert_eq!(
            codec.decode_sync_message(3, &bytes).unwrap(),
            Op::Put("k".into(), 4)
        );
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        let codec: SerdeCodec<Op, Option<i64>> = SerdeCodec::new();
        let err = codec.decode_message(&[0xc1]).unwrap_err();
        assert!(err.0.contains("Failed to decode message"));
        let entity_err: EntityError = err.into();
        assert!(matches!(entity_err, EntityError::Codec(_)));
        assert!(codec.decode_message(&codec.encode_message(&Op::Get("x".into())).unwrap()).is_ok());
    }
}
