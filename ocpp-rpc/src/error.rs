//! Error codes and local failure types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::identity::{Identity, RequestId};

/// OCPP-J error codes carried by CALLERROR envelopes (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::NotImplemented,
        ErrorCode::NotSupported,
        ErrorCode::InternalError,
        ErrorCode::ProtocolError,
        ErrorCode::SecurityError,
        ErrorCode::FormationViolation,
        ErrorCode::PropertyConstraintViolation,
        ErrorCode::OccurenceConstraintViolation,
        ErrorCode::TypeConstraintViolation,
        ErrorCode::GenericError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Lenient wire decoding: OCPP 2.x spellings map onto their 1.6
    /// counterparts and anything unknown becomes `GenericError`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "FormatViolation" => ErrorCode::FormationViolation,
            "OccurrenceConstraintViolation" => ErrorCode::OccurenceConstraintViolation,
            other => other.parse().unwrap_or(ErrorCode::GenericError),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .find(|code| code.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownErrorCode(s.to_string()))
    }
}

#[derive(Debug, Error)]
#[error("unknown error code: {0}")]
pub struct UnknownErrorCode(pub String);

/// Failure writing to a connection's transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("write failed: {0}")]
    Write(String),
}

/// Outcome of a `send` that did not produce a success payload.
///
/// `Remote` and `SignatureRejected` come from the peer; every other variant
/// is local to the calling side and never transmitted.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendError {
    #[error("{code}: {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("no response within the deadline")]
    Timeout,

    #[error("unknown client: {0}")]
    UnknownClient(Identity),

    #[error("transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("response signature rejected: {0}")]
    SignatureRejected(String),

    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),

    #[error("request payload could not be encoded: {0}")]
    InvalidRequest(String),

    #[error("response payload invalid: {0}")]
    InvalidResponse(String),
}

impl From<TransportError> for SendError {
    fn from(e: TransportError) -> Self {
        SendError::TransmissionFailed(e.to_string())
    }
}

/// Failure starting or keeping up a listener or uplink
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("upstream did not accept subprotocol {0}")]
    SubprotocolRejected(String),
}
