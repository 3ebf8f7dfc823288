//! Error types for peerwire.
//!
//! Every fallible operation in the crate returns [`RpcError`]. Errors
//! that cross the wire carry a JSON-RPC style numeric code (see the
//! constants below) so that a peer can tell a missing method from an
//! internal failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Generic server-side failure (timeouts, aborts, capacity on the wire).
pub const SERVER_ERROR: i32 = -32000;
/// Malformed request or duplicate stream id.
pub const INVALID_REQUEST: i32 = -32600;
/// No handler is registered for the requested method.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Request params did not decode into the handler's input type.
pub const INVALID_PARAMS: i32 = -32602;
/// Unexpected failure inside a handler.
pub const INTERNAL_ERROR: i32 = -32603;

/// Main error type for all peerwire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Malformed or oversize frame. Fatal for the connection.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Too many pending requests or active streams.
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Client-side deadline elapsed.
    #[error("Request {0} timed out")]
    Timeout(u32),

    /// Call aborted locally or by a Close frame from the peer.
    #[error("Request {0} cancelled")]
    Cancelled(u32),

    /// Socket send/receive failure. Fatal for the transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Error raised by a remote (or local) handler.
    #[error("Application error {code}: {message}")]
    Application {
        /// Numeric error code.
        code: i32,
        /// Human readable message.
        message: String,
        /// Optional structured detail.
        data: Option<serde_json::Value>,
    },

    /// The connection has been closed.
    #[error("Connection closed")]
    Closed,

    /// Requested buffer or frame exceeds the configured maximum.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Requested size.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

impl RpcError {
    /// Build an application error without structured data.
    pub fn application(code: i32, message: impl Into<String>) -> Self {
        RpcError::Application {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Shorthand for a [`METHOD_NOT_FOUND`] application error.
    pub fn method_not_found(method: &str) -> Self {
        Self::application(METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// Shorthand for an [`INTERNAL_ERROR`] application error.
    pub fn internal() -> Self {
        Self::application(INTERNAL_ERROR, "Internal error")
    }

    /// Numeric code used when this error is sent to a peer.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Application { code, .. } => *code,
            RpcError::Protocol(_) => INVALID_REQUEST,
            RpcError::Capacity(_)
            | RpcError::Timeout(_)
            | RpcError::Cancelled(_)
            | RpcError::Closed => SERVER_ERROR,
            _ => INTERNAL_ERROR,
        }
    }

    /// Detail-free message sent to a peer in place of the error's own
    /// text.
    fn public_message(&self) -> &'static str {
        match self {
            RpcError::Protocol(_) => "Invalid request",
            RpcError::Capacity(_) => "Capacity exceeded",
            RpcError::Timeout(_) => "Request timed out",
            RpcError::Cancelled(_) => "Request cancelled",
            RpcError::Closed => "Connection closed",
            _ => "Internal error",
        }
    }

    /// Whether the error tears down the whole connection rather than a
    /// single request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::Protocol(_) | RpcError::Transport(_) | RpcError::Io(_) | RpcError::Closed
        )
    }
}

/// Error payload carried by an `Error` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: i32,
    /// Human readable message.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl From<ErrorBody> for RpcError {
    fn from(body: ErrorBody) -> Self {
        RpcError::Application {
            code: body.code,
            message: body.message,
            data: body.data,
        }
    }
}

impl From<&RpcError> for ErrorBody {
    /// Only application errors keep their message; anything else keeps
    /// its code but is reported with a generic message, so internal
    /// detail never reaches the peer.
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Application {
                code,
                message,
                data,
            } => ErrorBody {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => ErrorBody {
                code: other.code(),
                message: other.public_message().to_string(),
                data: None,
            },
        }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(RpcError::method_not_found("x").code(), METHOD_NOT_FOUND);
        assert_eq!(RpcError::Timeout(1).code(), SERVER_ERROR);
        assert_eq!(RpcError::Protocol("bad".into()).code(), INVALID_REQUEST);
        assert_eq!(RpcError::Transport("gone".into()).code(), INTERNAL_ERROR);
    }

    #[test]
    fn test_is_fatal() {
        assert!(RpcError::Protocol("bad".into()).is_fatal());
        assert!(RpcError::Closed.is_fatal());
        assert!(!RpcError::Timeout(3).is_fatal());
        assert!(!RpcError::application(1, "x").is_fatal());
    }

    #[test]
    fn test_error_body_hides_internal_detail() {
        let err = RpcError::Transport("socket /tmp/secret gone".into());
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, INTERNAL_ERROR);
        assert_eq!(body.message, "Internal error");

        let err = RpcError::application(42, "nope");
        let body = ErrorBody::from(&err);
        assert_eq!(body.code, 42);
        assert_eq!(body.message, "nope");
    }

    #[test]
    fn test_error_body_code_matches_error_code() {
        let errors = vec![
            RpcError::Protocol("bad header".into()),
            RpcError::Capacity("Too many active streams".into()),
            RpcError::Timeout(3),
            RpcError::Cancelled(5),
            RpcError::Transport("broken pipe".into()),
            RpcError::application(-7, "declined"),
            RpcError::Closed,
            RpcError::FrameTooLarge { size: 10, max: 5 },
            RpcError::Io(std::io::Error::new(std::io::ErrorKind::Other, "io")),
            RpcError::Json(serde_json::from_str::<u8>("x").unwrap_err()),
            RpcError::MsgPackEncode(rmp_serde::encode::Error::UnknownLength),
            RpcError::MsgPackDecode(rmp_serde::from_slice::<u8>(&[]).unwrap_err()),
        ];
        for err in &errors {
            assert_eq!(ErrorBody::from(err).code, err.code(), "{err:?}");
        }

        let body = ErrorBody::from(&RpcError::Capacity("max 1000 in /srv".into()));
        assert_eq!(body.code, SERVER_ERROR);
        assert_eq!(body.message, "Capacity exceeded");
    }

    #[test]
    fn test_error_body_into_application() {
        let body = ErrorBody {
            code: -1,
            message: "boom".into(),
            data: Some(serde_json::json!({"k": 1})),
        };
        match RpcError::from(body) {
            RpcError::Application { code, message, data } => {
                assert_eq!(code, -1);
                assert_eq!(message, "boom");
                assert_eq!(data, Some(serde_json::json!({"k": 1})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
