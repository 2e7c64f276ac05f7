//! Wire format constants and primitive encoding.
//!
//! A packet on a byte-mode stream is a 4-byte length prefix, the packet body,
//! then any trailing payload blocks the body refers to:
//! ```text
//! ┌──────────────┬──────────────────────────────┬─────────────────────┐
//! │ Packet len   │ Messages                     │ Trailing payloads   │
//! │ 4 bytes      │ [tag u8][len u32][body] ...  │ raw bytes, in order │
//! │ uint32 LE    │                              │ (not counted in len)│
//! └──────────────┴──────────────────────────────┴─────────────────────┘
//! ```
//!
//! Strings and byte values are `[u32 LE length][bytes]`. Metadata is a
//! `u32 LE` entry count followed by `{name, kind u8, value}` entries.
//! A deadline is a presence byte, then `i64 LE` seconds and `u32 LE`
//! nanoseconds since the Unix epoch.
//!
//! All multi-byte integers are Little Endian.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PipeRpcError, Result};
use crate::metadata::{Metadata, MetadataEntry, MetadataValue};

/// Size of the packet length prefix.
pub const PACKET_PREFIX_SIZE: usize = 4;

/// Size of a message header inside a packet (tag + body length).
pub const MESSAGE_HEADER_SIZE: usize = 5;

/// Maximum packet body size, and maximum size of a single payload (1 GiB).
pub const MAX_PACKET_SIZE: u32 = 1_073_741_824;

/// Payloads above this size are sent as trailing blocks instead of being
/// copied into the packet body.
pub const PAYLOAD_IN_SEPARATE_PACKET_THRESHOLD: usize = 15 * 1024;

/// Message tags.
pub mod tags {
    pub const REQUEST_INIT: u8 = 1;
    pub const HEADERS: u8 = 2;
    pub const PAYLOAD_INFO: u8 = 3;
    pub const REQUEST_CONTROL: u8 = 4;
    pub const TRAILERS: u8 = 5;
}

const KIND_STRING: u8 = 0;
const KIND_BYTES: u8 = 1;

fn truncated(what: &str) -> PipeRpcError {
    PipeRpcError::Protocol(format!("Truncated {}", what))
}

/// Check that a length read from the wire fits into `buf`.
fn ensure_remaining(buf: &Bytes, needed: usize, what: &str) -> Result<()> {
    if buf.remaining() < needed {
        return Err(truncated(what));
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes, what: &str) -> Result<u8> {
    ensure_remaining(buf, 1, what)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_i32(buf: &mut Bytes, what: &str) -> Result<i32> {
    ensure_remaining(buf, 4, what)?;
    Ok(buf.get_i32_le())
}

/// Read a length-prefixed byte value without copying.
pub(crate) fn get_bytes(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    let len = get_u32(buf, what)? as usize;
    ensure_remaining(buf, len, what)?;
    Ok(buf.split_to(len))
}

pub(crate) fn get_string(buf: &mut Bytes, what: &str) -> Result<String> {
    let raw = get_bytes(buf, what)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| PipeRpcError::Protocol(format!("Invalid UTF-8 in {}", what)))
}

pub(crate) fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub(crate) fn put_metadata(buf: &mut BytesMut, metadata: &Metadata) {
    buf.put_u32_le(metadata.len() as u32);
    for entry in metadata {
        put_string(buf, entry.name());
        match entry.value() {
            MetadataValue::Text(v) => {
                buf.put_u8(KIND_STRING);
                put_string(buf, v);
            }
            MetadataValue::Binary(v) => {
                buf.put_u8(KIND_BYTES);
                put_bytes(buf, v);
            }
        }
    }
}

pub(crate) fn get_metadata(buf: &mut Bytes) -> Result<Metadata> {
    let count = get_u32(buf, "metadata count")?;
    let mut entries = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let name = get_string(buf, "metadata name")?;
        let value = match get_u8(buf, "metadata kind")? {
            KIND_STRING => MetadataValue::Text(get_string(buf, "metadata value")?),
            KIND_BYTES => MetadataValue::Binary(get_bytes(buf, "metadata value")?),
            other => {
                return Err(PipeRpcError::Protocol(format!(
                    "Unknown metadata value kind {}",
                    other
                )))
            }
        };
        entries.push(MetadataEntry::new(name, value));
    }
    Ok(entries.into_iter().collect())
}

pub(crate) fn put_deadline(buf: &mut BytesMut, deadline: Option<SystemTime>) {
    match deadline {
        None => buf.put_u8(0),
        Some(at) => {
            buf.put_u8(1);
            let (secs, nanos) = match at.duration_since(UNIX_EPOCH) {
                Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
                // Before the epoch: encode as a negative offset, nanos normalised to [0, 1e9).
                Err(e) => {
                    let d = e.duration();
                    if d.subsec_nanos() == 0 {
                        (-(d.as_secs() as i64), 0)
                    } else {
                        (-(d.as_secs() as i64) - 1, 1_000_000_000 - d.subsec_nanos())
                    }
                }
            };
            buf.put_i64_le(secs);
            buf.put_u32_le(nanos);
        }
    }
}

pub(crate) fn get_deadline(buf: &mut Bytes) -> Result<Option<SystemTime>> {
    if get_u8(buf, "deadline")? == 0 {
        return Ok(None);
    }
    ensure_remaining(buf, 12, "deadline")?;
    let secs = buf.get_i64_le();
    let nanos = buf.get_u32_le();
    if nanos >= 1_000_000_000 {
        return Err(PipeRpcError::Protocol("Invalid deadline nanoseconds".to_string()));
    }
    let at = if secs >= 0 {
        UNIX_EPOCH.checked_add(Duration::new(secs as u64, nanos))
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::from_secs(secs.unsigned_abs()))
            .and_then(|t| t.checked_add(Duration::from_nanos(nanos as u64)))
    };
    at.map(Some)
        .ok_or_else(|| PipeRpcError::Protocol(format!("Deadline out of range: {}s", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(PAYLOAD_IN_SEPARATE_PACKET_THRESHOLD, 15360);
        assert_eq!(MAX_PACKET_SIZE, 1 << 30);
    }

    #[test]
    fn test_string_encoding_layout() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "abc");
        assert_eq!(&buf[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_metadata_mixed_entries() {
        let mut md = Metadata::new();
        md.add("A1", "1");
        md.add_bytes("A2-bin", vec![2u8]);
        md.add("A1", "3");

        let mut buf = BytesMut::new();
        put_metadata(&mut buf, &md);
        let mut bytes = buf.freeze();
        let decoded = get_metadata(&mut bytes).unwrap();

        assert_eq!(decoded, md);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_deadline_encoding() {
        let at = UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        let mut buf = BytesMut::new();
        put_deadline(&mut buf, Some(at));
        put_deadline(&mut buf, None);
        assert_eq!(buf.len(), 1 + 12 + 1);

        let mut bytes = buf.freeze();
        assert_eq!(get_deadline(&mut bytes).unwrap(), Some(at));
        assert_eq!(get_deadline(&mut bytes).unwrap(), None);
    }

    #[test]
    fn test_deadline_before_epoch() {
        let at = UNIX_EPOCH - Duration::new(5, 250_000_000);
        let mut buf = BytesMut::new();
        put_deadline(&mut buf, Some(at));
        let mut bytes = buf.freeze();
        assert_eq!(get_deadline(&mut bytes).unwrap(), Some(at));
    }

    #[test]
    fn test_truncated_string_is_protocol_error() {
        let mut bytes = Bytes::from_static(&[10, 0, 0, 0, b'a']);
        let err = get_string(&mut bytes, "method").unwrap_err();
        assert!(matches!(err, PipeRpcError::Protocol(_)));
    }

    #[test]
    fn test_unknown_metadata_kind() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        put_string(&mut buf, "k");
        buf.put_u8(7);
        let mut bytes = buf.freeze();
        assert!(get_metadata(&mut bytes).is_err());
    }

    #[test]
    fn test_extreme_deadline_does_not_panic() {
        for secs in [i64::MAX, i64::MIN] {
            let mut buf = BytesMut::new();
            buf.put_u8(1);
            buf.put_i64_le(secs);
            buf.put_u32_le(999_999_999);
            let mut bytes = buf.freeze();
            match get_deadline(&mut bytes) {
                Ok(Some(_)) | Err(PipeRpcError::Protocol(_)) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
