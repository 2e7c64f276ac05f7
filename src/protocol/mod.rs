//! Protocol module - wire format, messages, packets, and frames.
//!
//! This module implements the binary protocol spoken on a connection:
//! - Primitive encoding and the packet layout ([`wire_format`])
//! - Tagged transport messages ([`TransportMessage`])
//! - Packet assembly and the packet reader ([`Packet`], [`PacketReader`])
//! - Decoded events handed to call contexts ([`Frame`], [`FrameHandler`])

mod frame;
mod message;
mod packet;
pub mod wire_format;

#[cfg(test)]
pub(crate) use frame::testing;
pub use frame::{Frame, FrameHandler};
pub use message::{RequestControl, TransportMessage};
pub use packet::{payload_size, Packet, PacketReader};
pub use wire_format::{MAX_PACKET_SIZE, PACKET_PREFIX_SIZE, PAYLOAD_IN_SEPARATE_PACKET_THRESHOLD};
