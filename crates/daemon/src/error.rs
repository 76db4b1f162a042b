//! Errors raised while talking to the daemon.

use std::io::ErrorKind;

use thiserror::Error;

/// Direction of a failed socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl std::fmt::Display for IoOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// A frame could not be moved across the daemon socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Outgoing frame would exceed the payload cap.
    #[error("frame of {size} bytes exceeds the {limit} byte cap")]
    Oversized { size: usize, limit: usize },

    /// Stream closed before `expected` bytes of the frame arrived.
    /// `read == 0` is a hang-up between frames.
    #[error("daemon stream closed after {read} of {expected} frame bytes")]
    Truncated { read: usize, expected: usize },

    /// Incoming length prefix is zero or above the cap.
    #[error("rejected frame length {length}: {reason}")]
    BadLength { length: u32, reason: String },

    #[error("could not encode frame: {cause}")]
    Encode { cause: String },

    /// Payload arrived whole but is not a message we understand, usually a
    /// protocol mismatch with the daemon.
    #[error("could not decode {payload_bytes} byte frame: {cause}")]
    Decode { cause: String, payload_bytes: usize },

    /// Socket read or write failed; read timeouts land here.
    #[error("socket {op} failed ({kind:?}, os error {os_code:?})")]
    Io {
        op: IoOp,
        kind: ErrorKind,
        os_code: Option<i32>,
    },

    #[error("daemon socket '{path}' unreachable ({kind:?})")]
    Connect { path: String, kind: ErrorKind },
}

impl TransportError {
    #[must_use]
    pub const fn oversized(size: usize, limit: usize) -> Self {
        Self::Oversized { size, limit }
    }

    #[must_use]
    pub const fn truncated(read: usize, expected: usize) -> Self {
        Self::Truncated { read, expected }
    }

    pub fn bad_length(length: u32, reason: impl Into<String>) -> Self {
        Self::BadLength {
            length,
            reason: reason.into(),
        }
    }

    pub fn encode(cause: impl ToString) -> Self {
        Self::Encode {
            cause: cause.to_string(),
        }
    }

    pub fn decode(cause: impl ToString, payload_bytes: usize) -> Self {
        Self::Decode {
            cause: cause.to_string(),
            payload_bytes,
        }
    }

    #[must_use]
    pub fn io(op: IoOp, err: &std::io::Error) -> Self {
        Self::Io {
            op,
            kind: err.kind(),
            os_code: err.raw_os_error(),
        }
    }

    pub fn connect(path: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Connect {
            path: path.into(),
            kind: err.kind(),
        }
    }

    /// Peer hung up cleanly between frames.
    #[must_use]
    pub const fn is_hangup(&self) -> bool {
        matches!(self, Self::Truncated { read: 0, .. })
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure of a single daemon call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// The daemon processed the call and rejected it.
    #[error("daemon returned {code:?}: {message}")]
    Status { code: StatusCode, message: String },

    /// The daemon answered a different call than the one issued.
    #[error("expected {expected} response, received {received}")]
    UnexpectedResponse {
        expected: &'static str,
        received: &'static str,
    },

    /// The blocking call could not be scheduled or was cancelled.
    #[error("call cancelled: {0}")]
    Cancelled(String),
}

/// Status codes the daemon reports for rejected calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    Unavailable,
    Internal,
}

impl RpcError {
    /// Create a status error
    pub fn status(code: StatusCode, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_messages_name_the_frame() {
        assert_eq!(
            TransportError::oversized(2_000_000, 1_048_576).to_string(),
            "frame of 2000000 bytes exceeds the 1048576 byte cap"
        );
        assert_eq!(
            TransportError::truncated(4, 504).to_string(),
            "daemon stream closed after 4 of 504 frame bytes"
        );
        assert_eq!(
            TransportError::decode("bad variant tag", 100).to_string(),
            "could not decode 100 byte frame: bad variant tag"
        );
    }

    #[test]
    fn test_io_error_keeps_direction_and_kind() {
        let err = std::io::Error::new(ErrorKind::TimedOut, "slow daemon");
        let transport = TransportError::io(IoOp::Read, &err);
        assert!(matches!(
            transport,
            TransportError::Io {
                op: IoOp::Read,
                kind: ErrorKind::TimedOut,
                ..
            }
        ));
        assert!(transport.to_string().starts_with("socket read failed"));
    }

    #[test]
    fn test_only_clean_close_is_hangup() {
        assert!(TransportError::truncated(0, 4).is_hangup());
        assert!(!TransportError::truncated(4, 104).is_hangup());
        assert!(!TransportError::bad_length(0, "empty").is_hangup());
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::status(StatusCode::NotFound, "no program 7");
        assert_eq!(err.to_string(), "daemon returned NotFound: no program 7");

        let err = RpcError::from(TransportError::truncated(0, 4));
        assert!(err.to_string().starts_with("transport:"));
    }
}
