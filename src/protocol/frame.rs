//! Decoded protocol events.
//!
//! A [`Frame`] is what a call context sees: `PayloadInfo` plus its bytes
//! (inline or trailing) arrive as a single [`Frame::Payload`].

use std::time::SystemTime;

use bytes::Bytes;

use super::message::RequestControl;
use crate::metadata::Metadata;
use crate::status::Status;

/// One decoded event on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    RequestInit {
        method_full_name: String,
        deadline: Option<SystemTime>,
        connection_id: u32,
    },
    Headers(Metadata),
    Payload(Bytes),
    Control(RequestControl),
    Trailers {
        status: Status,
        metadata: Metadata,
    },
}

impl Frame {
    /// Short name used in connection logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::RequestInit { .. } => "RequestInit",
            Frame::Headers(_) => "Headers",
            Frame::Payload(_) => "Payload",
            Frame::Control(RequestControl::Cancel) => "Cancel",
            Frame::Control(RequestControl::StreamEnd) => "StreamEnd",
            Frame::Trailers { .. } => "Trailers",
        }
    }
}

/// Receiver of decoded frames; implemented by each call context.
pub trait FrameHandler: Send + Sync {
    fn handle_frame(&self, frame: Frame);

    /// Called after every frame of a packet has been handled.
    fn end_of_packet(&self) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Handler that records every frame it sees.
    #[derive(Default)]
    pub struct RecordingHandler {
        pub frames: Mutex<Vec<Frame>>,
    }

    impl FrameHandler for RecordingHandler {
        fn handle_frame(&self, frame: Frame) {
            self.frames.lock().push(frame);
        }
    }
}
