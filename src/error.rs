//! Error types for pipe-rpc.

use thiserror::Error;

use crate::status::{RpcError, StatusCode};

/// Main error type for all pipe-rpc operations.
#[derive(Debug, Error)]
pub enum PipeRpcError {
    /// I/O error during pipe/socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (malformed packet, truncated message, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream where more bytes were expected.
    #[error("End of stream")]
    EndOfStream,

    /// The call finished with a non-OK status.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// API misuse: overlapping reads, writes after completion, and so on.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A local operation was attempted on a call that is already cancelled.
    #[error("Operation was cancelled")]
    Cancelled,
}

impl PipeRpcError {
    /// Status code carried by this error, if it is a call failure.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            PipeRpcError::Rpc(e) => Some(e.code()),
            _ => None,
        }
    }

    /// Shorthand for a usage error.
    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        PipeRpcError::InvalidOperation(message.into())
    }
}

/// Result type alias using PipeRpcError.
pub type Result<T> = std::result::Result<T, PipeRpcError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    #[test]
    fn test_status_code_of_rpc_error() {
        let err: PipeRpcError = RpcError::new(StatusCode::NotFound, "missing").into();
        assert_eq!(err.status_code(), Some(StatusCode::NotFound));
        assert_eq!(err.to_string(), "Status(StatusCode=NotFound, Detail=\"missing\")");
    }

    #[test]
    fn test_status_code_of_other_errors() {
        assert_eq!(PipeRpcError::Cancelled.status_code(), None);
        assert_eq!(PipeRpcError::EndOfStream.status_code(), None);
        let io: PipeRpcError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert_eq!(io.status_code(), None);
    }

    #[test]
    fn test_rpc_error_keeps_status() {
        let err = PipeRpcError::from(RpcError::from(Status::new(StatusCode::Aborted, "x")));
        match err {
            PipeRpcError::Rpc(e) => assert_eq!(e.status().detail(), "x"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
