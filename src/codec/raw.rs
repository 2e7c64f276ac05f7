//! Raw codec - pass-through for payloads that are already bytes.

use bytes::Bytes;

use super::Marshaller;
use crate::error::Result;

/// Marshaller for `Bytes` messages; no transformation is applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Marshaller<Bytes> for RawCodec {
    #[inline]
    fn serialize(&self, value: &Bytes) -> Result<Bytes> {
        // Clone of `Bytes` shares the buffer.
        Ok(value.clone())
    }

    #[inline]
    fn deserialize(&self, payload: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_shares_buffer() {
        let original = Bytes::from_static(b"static data");
        let serialized = RawCodec.serialize(&original).unwrap();
        assert_eq!(serialized.as_ptr(), original.as_ptr());
    }

    #[test]
    fn test_all_byte_values_preserved() {
        let all_bytes: Vec<u8> = (0..=255).collect();
        let decoded = RawCodec.deserialize(&all_bytes).unwrap();
        assert_eq!(&decoded[..], &all_bytes[..]);
    }

    #[test]
    fn test_empty_payload() {
        assert!(RawCodec.deserialize(b"").unwrap().is_empty());
    }
}
