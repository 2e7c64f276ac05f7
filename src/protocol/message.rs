//! Transport messages: the tagged records carried inside a packet.

use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{
    get_deadline, get_i32, get_metadata, get_string, get_u32, get_u8, put_deadline, put_metadata,
    put_string, tags, MESSAGE_HEADER_SIZE,
};
use crate::error::{PipeRpcError, Result};
use crate::metadata::Metadata;
use crate::status::{Status, StatusCode};

/// Control signal sent mid-call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestControl {
    /// The sender gave up on the call.
    Cancel,
    /// The sender's message stream is complete.
    StreamEnd,
}

impl RequestControl {
    fn as_u8(self) -> u8 {
        match self {
            RequestControl::Cancel => 0,
            RequestControl::StreamEnd => 1,
        }
    }

    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(RequestControl::Cancel),
            1 => Ok(RequestControl::StreamEnd),
            other => Err(PipeRpcError::Protocol(format!(
                "Unknown request control {}",
                other
            ))),
        }
    }
}

/// One message on the wire.
///
/// `PayloadInfo` only announces a payload; the payload bytes follow the
/// message in the packet body (`in_same_packet`) or after the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    RequestInit {
        method_full_name: String,
        deadline: Option<SystemTime>,
        connection_id: u32,
    },
    Headers(Metadata),
    PayloadInfo {
        size: u32,
        in_same_packet: bool,
    },
    RequestControl(RequestControl),
    Trailers {
        status: Status,
        metadata: Metadata,
    },
}

impl TransportMessage {
    fn tag(&self) -> u8 {
        match self {
            TransportMessage::RequestInit { .. } => tags::REQUEST_INIT,
            TransportMessage::Headers(_) => tags::HEADERS,
            TransportMessage::PayloadInfo { .. } => tags::PAYLOAD_INFO,
            TransportMessage::RequestControl(_) => tags::REQUEST_CONTROL,
            TransportMessage::Trailers { .. } => tags::TRAILERS,
        }
    }

    /// Short name used in connection logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportMessage::RequestInit { .. } => "RequestInit",
            TransportMessage::Headers(_) => "Headers",
            TransportMessage::PayloadInfo { .. } => "PayloadInfo",
            TransportMessage::RequestControl(RequestControl::Cancel) => "Cancel",
            TransportMessage::RequestControl(RequestControl::StreamEnd) => "StreamEnd",
            TransportMessage::Trailers { .. } => "Trailers",
        }
    }

    /// Append `[tag][body len][body]` to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        let len_at = buf.len();
        buf.put_u32_le(0);
        let body_start = buf.len();

        match self {
            TransportMessage::RequestInit {
                method_full_name,
                deadline,
                connection_id,
            } => {
                put_string(buf, method_full_name);
                put_deadline(buf, *deadline);
                buf.put_u32_le(*connection_id);
            }
            TransportMessage::Headers(metadata) => put_metadata(buf, metadata),
            TransportMessage::PayloadInfo {
                size,
                in_same_packet,
            } => {
                buf.put_u32_le(*size);
                buf.put_u8(u8::from(*in_same_packet));
            }
            TransportMessage::RequestControl(control) => buf.put_u8(control.as_u8()),
            TransportMessage::Trailers { status, metadata } => {
                buf.put_i32_le(status.code().as_i32());
                put_string(buf, status.detail());
                put_metadata(buf, metadata);
            }
        }

        let body_len = (buf.len() - body_start) as u32;
        buf[len_at..len_at + 4].copy_from_slice(&body_len.to_le_bytes());
    }

    /// Take the next message off the front of a packet body.
    ///
    /// Returns `Ok(None)` for a message with an unknown tag; its body has
    /// already been skipped.
    pub fn decode(packet: &mut Bytes) -> Result<Option<Self>> {
        if packet.len() < MESSAGE_HEADER_SIZE {
            return Err(PipeRpcError::Protocol(format!(
                "Truncated message header: {} bytes",
                packet.len()
            )));
        }
        let tag = get_u8(packet, "message tag")?;
        let len = get_u32(packet, "message length")? as usize;
        if packet.len() < len {
            return Err(PipeRpcError::Protocol(format!(
                "Message body of {} bytes exceeds packet remainder of {}",
                len,
                packet.len()
            )));
        }
        let mut body = packet.split_to(len);

        let message = match tag {
            tags::REQUEST_INIT => TransportMessage::RequestInit {
                method_full_name: get_string(&mut body, "method name")?,
                deadline: get_deadline(&mut body)?,
                connection_id: get_u32(&mut body, "connection id")?,
            },
            tags::HEADERS => TransportMessage::Headers(get_metadata(&mut body)?),
            tags::PAYLOAD_INFO => TransportMessage::PayloadInfo {
                size: get_u32(&mut body, "payload size")?,
                in_same_packet: get_u8(&mut body, "payload placement")? != 0,
            },
            tags::REQUEST_CONTROL => {
                TransportMessage::RequestControl(RequestControl::from_u8(get_u8(
                    &mut body,
                    "request control",
                )?)?)
            }
            tags::TRAILERS => {
                let code = StatusCode::from_i32(get_i32(&mut body, "status code")?);
                let detail = get_string(&mut body, "status detail")?;
                TransportMessage::Trailers {
                    status: Status::new(code, detail),
                    metadata: get_metadata(&mut body)?,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    fn encode(message: &TransportMessage) -> Bytes {
        let mut buf = BytesMut::new();
        message.encode_into(&mut buf);
        buf.freeze()
    }

    #[test]
    fn test_request_init() {
        let message = TransportMessage::RequestInit {
            method_full_name: "/Test/SimpleUnary".to_string(),
            deadline: Some(UNIX_EPOCH + Duration::from_millis(1_700_000_000_123)),
            connection_id: 7,
        };
        let mut bytes = encode(&message);
        assert_eq!(bytes[0], tags::REQUEST_INIT);
        assert_eq!(TransportMessage::decode(&mut bytes).unwrap(), Some(message));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_trailers_with_metadata() {
        let mut metadata = Metadata::new();
        metadata.add("test_key", "test_value");
        metadata.add_bytes("b-bin", vec![0u8, 255]);
        let message = TransportMessage::Trailers {
            status: Status::new(StatusCode::InvalidArgument, "invalid argument"),
            metadata,
        };
        let mut bytes = encode(&message);
        assert_eq!(TransportMessage::decode(&mut bytes).unwrap(), Some(message));
    }

    #[test]
    fn test_headers_preserve_order() {
        let mut metadata = Metadata::new();
        metadata.add("A1", "1");
        metadata.add_bytes("A2-bin", vec![2u8]);
        metadata.add("A1", "again");
        let mut bytes = encode(&TransportMessage::Headers(metadata.clone()));
        match TransportMessage::decode(&mut bytes).unwrap() {
            Some(TransportMessage::Headers(decoded)) => assert_eq!(decoded, metadata),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_controls_and_payload_info() {
        let mut buf = BytesMut::new();
        TransportMessage::RequestControl(RequestControl::Cancel).encode_into(&mut buf);
        TransportMessage::RequestControl(RequestControl::StreamEnd).encode_into(&mut buf);
        TransportMessage::PayloadInfo {
            size: 10,
            in_same_packet: true,
        }
        .encode_into(&mut buf);
        let mut bytes = buf.freeze();

        assert_eq!(
            TransportMessage::decode(&mut bytes).unwrap(),
            Some(TransportMessage::RequestControl(RequestControl::Cancel))
        );
        assert_eq!(
            TransportMessage::decode(&mut bytes).unwrap(),
            Some(TransportMessage::RequestControl(RequestControl::StreamEnd))
        );
        assert_eq!(
            TransportMessage::decode(&mut bytes).unwrap(),
            Some(TransportMessage::PayloadInfo {
                size: 10,
                in_same_packet: true
            })
        );
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u8(99);
        buf.put_u32_le(3);
        buf.put_slice(&[1, 2, 3]);
        TransportMessage::RequestControl(RequestControl::Cancel).encode_into(&mut buf);
        let mut bytes = buf.freeze();

        assert_eq!(TransportMessage::decode(&mut bytes).unwrap(), None);
        assert_eq!(
            TransportMessage::decode(&mut bytes).unwrap(),
            Some(TransportMessage::RequestControl(RequestControl::Cancel))
        );
    }

    #[test]
    fn test_body_longer_than_packet() {
        let mut buf = BytesMut::new();
        buf.put_u8(tags::HEADERS);
        buf.put_u32_le(100);
        buf.put_slice(&[0, 0, 0, 0]);
        let mut bytes = buf.freeze();
        assert!(matches!(
            TransportMessage::decode(&mut bytes),
            Err(PipeRpcError::Protocol(_))
        ));
    }
}
