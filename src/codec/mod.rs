//! Codec module - converting call messages to and from payload bytes.
//!
//! The transport itself only moves opaque payloads. A [`Marshaller`] turns a
//! typed request or response into bytes and back; each [`Method`] carries one
//! for its request type and one for its response type.
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` for any serde type
//! - [`RawCodec`] - Pass-through for `Bytes` payloads
//!
//! # Example
//!
//! ```
//! use pipe_rpc::codec::{Marshaller, MsgPackCodec, RawCodec};
//! use bytes::Bytes;
//!
//! let encoded = Marshaller::<String>::serialize(&MsgPackCodec, &"hello".to_string()).unwrap();
//! let decoded: String = MsgPackCodec.deserialize(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let raw = RawCodec.serialize(&Bytes::from_static(b"binary data")).unwrap();
//! assert_eq!(&raw[..], b"binary data");
//! ```
//!
//! [`Method`]: crate::method::Method

mod msgpack;
mod raw;

pub use msgpack::MsgPackCodec;
pub use raw::RawCodec;

use bytes::Bytes;

use crate::error::Result;

/// Converts values of type `T` to payload bytes and back.
pub trait Marshaller<T>: Send + Sync {
    /// Serialize a value into a payload.
    fn serialize(&self, value: &T) -> Result<Bytes>;

    /// Deserialize a payload into a value.
    fn deserialize(&self, payload: &[u8]) -> Result<T>;
}
