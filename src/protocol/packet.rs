//! Packet assembly and the packet reader.
//!
//! A [`Packet`] collects encoded messages plus the payloads that are too
//! large to copy into the body. [`PacketReader`] reads one packet at a time
//! off a byte stream and dispatches its messages as [`Frame`]s.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame::{Frame, FrameHandler};
use super::message::TransportMessage;
use super::wire_format::{MAX_PACKET_SIZE, PACKET_PREFIX_SIZE, PAYLOAD_IN_SEPARATE_PACKET_THRESHOLD};
use crate::error::{PipeRpcError, Result};

/// Wire size of a payload of `len` bytes.
pub fn payload_size(len: usize) -> Result<u32> {
    u32::try_from(len)
        .ok()
        .filter(|size| *size <= MAX_PACKET_SIZE)
        .ok_or_else(|| {
            PipeRpcError::Protocol(format!("Payload size {} exceeds maximum {}", len, MAX_PACKET_SIZE))
        })
}

/// An outgoing packet: message body plus trailing payload blocks.
#[derive(Debug, Default)]
pub struct Packet {
    body: BytesMut,
    trailing: Vec<Bytes>,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message to the body.
    pub fn push(&mut self, message: &TransportMessage) {
        message.encode_into(&mut self.body);
    }

    /// Append a payload, inline or as a trailing block depending on size.
    ///
    /// Fails with `Protocol` if the payload exceeds [`MAX_PACKET_SIZE`].
    pub fn push_payload(&mut self, payload: Bytes) -> Result<()> {
        let size = payload_size(payload.len())?;
        let in_same_packet = payload.len() <= PAYLOAD_IN_SEPARATE_PACKET_THRESHOLD;
        self.push(&TransportMessage::PayloadInfo { size, in_same_packet });
        if in_same_packet {
            self.body.extend_from_slice(&payload);
        } else {
            self.trailing.push(payload);
        }
        Ok(())
    }

    /// Move everything from `other` onto the end of this packet.
    ///
    /// Trailing blocks stay in order, so the reader consumes them in the
    /// same order their `PayloadInfo` messages appear.
    pub fn append(&mut self, other: Packet) {
        self.body.extend_from_slice(&other.body);
        self.trailing.extend(other.trailing);
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.trailing.is_empty()
    }

    /// Length prefix for the body.
    pub fn prefix(&self) -> [u8; PACKET_PREFIX_SIZE] {
        (self.body.len() as u32).to_le_bytes()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn trailing(&self) -> &[Bytes] {
        &self.trailing
    }

    /// Total bytes on the wire, prefix included.
    pub fn wire_len(&self) -> usize {
        PACKET_PREFIX_SIZE + self.body.len() + self.trailing.iter().map(Bytes::len).sum::<usize>()
    }
}

/// Reads packets from a byte-mode stream.
pub struct PacketReader<R> {
    reader: R,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read one length-prefixed packet body.
    ///
    /// Fails with `EndOfStream` if the stream ends before a full packet.
    pub async fn read_packet(&mut self) -> Result<Bytes> {
        let mut prefix = [0u8; PACKET_PREFIX_SIZE];
        self.read_exact(&mut prefix).await?;

        let len = u32::from_le_bytes(prefix);
        if len > MAX_PACKET_SIZE {
            return Err(PipeRpcError::Protocol(format!(
                "Packet size {} exceeds maximum {}",
                len, MAX_PACKET_SIZE
            )));
        }

        let mut body = BytesMut::zeroed(len as usize);
        self.read_exact(&mut body).await?;
        Ok(body.freeze())
    }

    /// Read one packet and dispatch its frames to `handler`.
    ///
    /// Returns `Ok(false)` once a `Trailers` frame has been dispatched; no
    /// further messages in that packet are processed.
    pub async fn read(&mut self, handler: &dyn FrameHandler) -> Result<bool> {
        let mut packet = self.read_packet().await?;

        while !packet.is_empty() {
            let message = match TransportMessage::decode(&mut packet)? {
                Some(message) => message,
                None => {
                    tracing::warn!("Skipping message with unknown tag");
                    continue;
                }
            };

            let frame = match message {
                TransportMessage::RequestInit {
                    method_full_name,
                    deadline,
                    connection_id,
                } => Frame::RequestInit {
                    method_full_name,
                    deadline,
                    connection_id,
                },
                TransportMessage::Headers(metadata) => Frame::Headers(metadata),
                TransportMessage::PayloadInfo {
                    size,
                    in_same_packet,
                } => Frame::Payload(self.take_payload(&mut packet, size, in_same_packet).await?),
                TransportMessage::RequestControl(control) => Frame::Control(control),
                TransportMessage::Trailers { status, metadata } => {
                    handler.handle_frame(Frame::Trailers { status, metadata });
                    handler.end_of_packet();
                    return Ok(false);
                }
            };
            handler.handle_frame(frame);
        }

        handler.end_of_packet();
        Ok(true)
    }

    async fn take_payload(&mut self, packet: &mut Bytes, size: u32, in_same_packet: bool) -> Result<Bytes> {
        if size > MAX_PACKET_SIZE {
            return Err(PipeRpcError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                size, MAX_PACKET_SIZE
            )));
        }
        let size = size as usize;

        if in_same_packet {
            if packet.len() < size {
                return Err(PipeRpcError::Protocol(format!(
                    "Inline payload of {} bytes exceeds packet remainder of {}",
                    size,
                    packet.len()
                )));
            }
            return Ok(packet.split_to(size));
        }

        let mut payload = BytesMut::zeroed(size);
        self.read_exact(&mut payload).await?;
        Ok(payload.freeze())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PipeRpcError::EndOfStream),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Metadata;
    use crate::protocol::frame::testing::RecordingHandler;
    use crate::protocol::message::RequestControl;
    use crate::status::{Status, StatusCode};
    use tokio::io::{duplex, AsyncWriteExt};

    async fn write_packet<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, packet: &Packet) {
        w.write_all(&packet.prefix()).await.unwrap();
        w.write_all(packet.body()).await.unwrap();
        for block in packet.trailing() {
            w.write_all(block).await.unwrap();
        }
        w.flush().await.unwrap();
    }

    fn payload_of(size: usize) -> Bytes {
        (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    #[test]
    fn test_small_payload_inline() {
        let mut packet = Packet::new();
        packet.push_payload(payload_of(10)).unwrap();
        assert!(packet.trailing().is_empty());

        let mut body = Bytes::copy_from_slice(packet.body());
        assert_eq!(
            TransportMessage::decode(&mut body).unwrap(),
            Some(TransportMessage::PayloadInfo {
                size: 10,
                in_same_packet: true
            })
        );
        assert_eq!(body, payload_of(10));
    }

    #[test]
    fn test_threshold_boundary() {
        let mut packet = Packet::new();
        packet.push_payload(payload_of(PAYLOAD_IN_SEPARATE_PACKET_THRESHOLD)).unwrap();
        assert!(packet.trailing().is_empty());

        packet.push_payload(payload_of(PAYLOAD_IN_SEPARATE_PACKET_THRESHOLD + 1)).unwrap();
        assert_eq!(packet.trailing().len(), 1);
    }

    #[tokio::test]
    async fn test_large_payload_trailing_reassembles() {
        let size = 20 * 1024 * 1024;
        let mut packet = Packet::new();
        packet.push_payload(payload_of(size)).unwrap();
        assert_eq!(packet.trailing().len(), 1);

        let mut body = Bytes::copy_from_slice(packet.body());
        assert_eq!(
            TransportMessage::decode(&mut body).unwrap(),
            Some(TransportMessage::PayloadInfo {
                size: size as u32,
                in_same_packet: false
            })
        );
        assert!(body.is_empty());

        let (mut client, server) = duplex(64 * 1024);
        let writer = tokio::spawn(async move {
            write_packet(&mut client, &packet).await;
            client
        });

        let handler = RecordingHandler::default();
        let mut reader = PacketReader::new(server);
        assert!(reader.read(&handler).await.unwrap());
        let _client = writer.await.unwrap();

        let frames = handler.frames.lock();
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Payload(received) => assert!(received == &payload_of(size)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_merged_packets_keep_order() {
        let mut first = Packet::new();
        first.push(&TransportMessage::Headers(Metadata::new()));
        first.push_payload(payload_of(20_000)).unwrap();
        let mut second = Packet::new();
        second.push_payload(payload_of(5)).unwrap();
        second.push_payload(payload_of(30_000)).unwrap();
        second.push(&TransportMessage::RequestControl(RequestControl::StreamEnd));
        first.append(second);
        assert_eq!(first.trailing().len(), 2);

        let (mut client, server) = duplex(1024 * 1024);
        write_packet(&mut client, &first).await;

        let handler = RecordingHandler::default();
        let mut reader = PacketReader::new(server);
        assert!(reader.read(&handler).await.unwrap());

        let frames = handler.frames.lock();
        assert_eq!(
            frames.as_slice(),
            &[
                Frame::Headers(Metadata::new()),
                Frame::Payload(payload_of(20_000)),
                Frame::Payload(payload_of(5)),
                Frame::Payload(payload_of(30_000)),
                Frame::Control(RequestControl::StreamEnd),
            ]
        );
    }

    #[tokio::test]
    async fn test_trailers_end_dispatch() {
        let mut packet = Packet::new();
        packet.push(&TransportMessage::Trailers {
            status: Status::new(StatusCode::Unimplemented, ""),
            metadata: Metadata::new(),
        });
        packet.push(&TransportMessage::RequestControl(RequestControl::Cancel));

        let (mut client, server) = duplex(4096);
        write_packet(&mut client, &packet).await;

        let handler = RecordingHandler::default();
        let mut reader = PacketReader::new(server);
        assert!(!reader.read(&handler).await.unwrap());
        assert_eq!(handler.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_end_of_stream() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = PacketReader::new(server);
        assert!(matches!(reader.read_packet().await, Err(PipeRpcError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_truncated_packet_is_end_of_stream() {
        let (mut client, server) = duplex(64);
        client.write_all(&[10, 0, 0, 0, 1, 2]).await.unwrap();
        drop(client);
        let mut reader = PacketReader::new(server);
        assert!(matches!(reader.read_packet().await, Err(PipeRpcError::EndOfStream)));
    }

    #[tokio::test]
    async fn test_oversized_packet_rejected() {
        let (mut client, server) = duplex(64);
        client.write_all(&(MAX_PACKET_SIZE + 1).to_le_bytes()).await.unwrap();
        let mut reader = PacketReader::new(server);
        assert!(matches!(reader.read_packet().await, Err(PipeRpcError::Protocol(_))));
    }

    #[test]
    fn test_payload_size_limit() {
        assert_eq!(payload_size(0).unwrap(), 0);
        assert_eq!(payload_size(MAX_PACKET_SIZE as usize).unwrap(), MAX_PACKET_SIZE);
        assert!(matches!(
            payload_size(MAX_PACKET_SIZE as usize + 1),
            Err(PipeRpcError::Protocol(_))
        ));
        #[cfg(target_pointer_width = "64")]
        assert!(matches!(
            payload_size(u32::MAX as usize + 1),
            Err(PipeRpcError::Protocol(_))
        ));
    }
}
