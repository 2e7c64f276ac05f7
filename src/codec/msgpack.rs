//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named` (struct-as-map), so messages stay
//! readable by other MessagePack implementations and tolerate field
//! reordering between peers.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Marshaller;
use crate::error::Result;

/// MessagePack codec for structured data.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized.
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl<T> Marshaller<T> for MsgPackCodec
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Bytes> {
        Self::encode(value).map(Bytes::from)
    }

    fn deserialize(&self, payload: &[u8]) -> Result<T> {
        Self::decode(payload)
    }
}
