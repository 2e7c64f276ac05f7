//! Call status codes and status-carrying call errors.
//!
//! Codes follow the gRPC numbering so that values written to the wire in a
//! `Trailers` message are interchangeable with other gRPC transports.

use std::fmt;

use thiserror::Error;

use crate::metadata::Metadata;

/// Detail used whenever a call fails because the connection could not be
/// established or vanished before the call completed.
pub const FAILED_TO_CONNECT: &str = "failed to connect to all addresses";

/// Detail sent to the peer when a handler fails with a non-status error.
pub const HANDLER_EXCEPTION: &str = "Exception was thrown by handler.";

/// RPC status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Map a wire value to a code. Values outside the known range become
    /// `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }

    /// Wire value of this code.
    #[inline]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Status of a finished call: a code plus a human-readable detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    detail: String,
}

impl Status {
    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// The OK status with an empty detail.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    #[inline]
    pub fn code(&self) -> StatusCode {
        self.code
    }

    #[inline]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Status(StatusCode={:?}, Detail={:?})", self.code, self.detail)
    }
}

/// A call failure: the final status plus the trailing metadata that came
/// with it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{status}")]
pub struct RpcError {
    status: Status,
    trailers: Metadata,
}

impl RpcError {
    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        Self::from(Status::new(code, detail))
    }

    pub fn with_trailers(status: Status, trailers: Metadata) -> Self {
        Self { status, trailers }
    }

    /// `Unavailable` with the standard connect-failure detail.
    pub fn unavailable() -> Self {
        Self::new(StatusCode::Unavailable, FAILED_TO_CONNECT)
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, "")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(StatusCode::DeadlineExceeded, "")
    }

    #[inline]
    pub fn code(&self) -> StatusCode {
        self.status.code
    }

    #[inline]
    pub fn status(&self) -> &Status {
        &self.status
    }

    #[inline]
    pub fn trailers(&self) -> &Metadata {
        &self.trailers
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        Self {
            status,
            trailers: Metadata::new(),
        }
    }
}
