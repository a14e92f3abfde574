//! Error taxonomy shared by client and server.
//!
//! Errors that can cross the wire map to an [`ErrorCode`]; the server sends
//! them as a structured `{code, message}` pair and the client raises the same
//! variant again with [`RbError::from_wire`].

use serde::{Deserialize, Serialize};

/// Errors produced by the rbackup library.
#[derive(Debug, thiserror::Error)]
pub enum RbError {
    #[error("protocol type mismatch: {0}")]
    ProtocolTypeMismatch(String),

    #[error("protocol version mismatch: {0}")]
    ProtocolVersionMismatch(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden path: {0}")]
    ForbiddenPath(String),

    #[error("malformed path: {0}")]
    MalformedPath(String),

    #[error("wrong segment: {0}")]
    WrongSegment(String),

    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("concurrent write: {0}")]
    ConcurrentWrite(String),

    #[error("segment out of range: {0}")]
    SegmentOutOfRange(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server error: {0}")]
    Internal(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("stopped")]
    Stopped,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

pub type Result<T, E = RbError> = std::result::Result<T, E>;

/// Wire representation of an error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    ProtocolTypeMismatch,
    ProtocolVersionMismatch,
    Unauthenticated,
    ForbiddenPath,
    MalformedPath,
    WrongSegment,
    InvalidChecksum,
    ConcurrentWrite,
    SegmentOutOfRange,
    InvalidRequest,
    Internal,
}

/// Structured error carried in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

/// What a caller should do with a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Transient; release the operation and try again.
    Retry,
    /// Retrying cannot succeed.
    Fatal,
}

impl RbError {
    /// Converts to the structured form sent in a response.
    ///
    /// Local-only failures (I/O, codec, config) are reported as `Internal`
    /// so server internals do not leak to clients.
    pub fn to_wire(&self) -> WireError {
        let (code, message) = match self {
            Self::ProtocolTypeMismatch(m) => (ErrorCode::ProtocolTypeMismatch, m.clone()),
            Self::ProtocolVersionMismatch(m) => (ErrorCode::ProtocolVersionMismatch, m.clone()),
            Self::Unauthenticated(m) => (ErrorCode::Unauthenticated, m.clone()),
            Self::ForbiddenPath(m) => (ErrorCode::ForbiddenPath, m.clone()),
            Self::MalformedPath(m) => (ErrorCode::MalformedPath, m.clone()),
            Self::WrongSegment(m) => (ErrorCode::WrongSegment, m.clone()),
            Self::InvalidChecksum(m) => (ErrorCode::InvalidChecksum, m.clone()),
            Self::ConcurrentWrite(m) => (ErrorCode::ConcurrentWrite, m.clone()),
            Self::SegmentOutOfRange(m) => (ErrorCode::SegmentOutOfRange, m.clone()),
            Self::InvalidRequest(m) => (ErrorCode::InvalidRequest, m.clone()),
            Self::Internal(m) => (ErrorCode::Internal, m.clone()),
            Self::Stopped => (ErrorCode::Internal, "server stopping".to_string()),
            _ => (ErrorCode::Internal, "internal_server_error".to_string()),
        };
        WireError { code, message }
    }

    /// Raises a structured response error as the matching variant.
    pub fn from_wire(err: WireError) -> Self {
        let m = err.message;
        match err.code {
            ErrorCode::ProtocolTypeMismatch => Self::ProtocolTypeMismatch(m),
            ErrorCode::ProtocolVersionMismatch => Self::ProtocolVersionMismatch(m),
            ErrorCode::Unauthenticated => Self::Unauthenticated(m),
            ErrorCode::ForbiddenPath => Self::ForbiddenPath(m),
            ErrorCode::MalformedPath => Self::MalformedPath(m),
            ErrorCode::WrongSegment => Self::WrongSegment(m),
            ErrorCode::InvalidChecksum => Self::InvalidChecksum(m),
            ErrorCode::ConcurrentWrite => Self::ConcurrentWrite(m),
            ErrorCode::SegmentOutOfRange => Self::SegmentOutOfRange(m),
            ErrorCode::InvalidRequest => Self::InvalidRequest(m),
            ErrorCode::Internal => Self::Internal(m),
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Io(_) | Self::Codec(_) | Self::Config(_) => None,
            Self::ConnectionClosed(_) | Self::Timeout(_) => None,
            other => Some(other.to_wire().code),
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::ProtocolTypeMismatch(_)
            | Self::ProtocolVersionMismatch(_)
            | Self::Unauthenticated(_)
            | Self::ForbiddenPath(_)
            | Self::MalformedPath(_)
            | Self::InvalidRequest(_)
            | Self::SegmentOutOfRange(_)
            | Self::Config(_)
            | Self::Codec(_)
            | Self::Stopped => Disposition::Fatal,
            Self::WrongSegment(_)
            | Self::InvalidChecksum(_)
            | Self::ConcurrentWrite(_)
            | Self::Internal(_)
            | Self::ConnectionClosed(_)
            | Self::Timeout(_)
            | Self::Io(_) => Disposition::Retry,
        }
    }

    /// True for failures of the transport itself; the connection must be dropped.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::ConnectionClosed(_) | Self::Timeout(_) | Self::Codec(_)
        )
    }
}
