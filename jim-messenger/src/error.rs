//! Error taxonomy shared by the server, the peer transport and the stores.

use std::io;

use serde_json::error::Category;
use thiserror::Error;

use crate::message::MAX_PACKAGE_LENGTH;

/// A frame that could not be turned into a [`crate::message::Frame`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame body of {len} bytes exceeds the {MAX_PACKAGE_LENGTH} byte limit")]
    Oversized { len: usize },
    #[error("truncated frame")]
    Truncated,
    #[error("{0} unexpected bytes after the frame body")]
    TrailingBytes(usize),
    #[error("frame body is not valid JSON: {0}")]
    Syntax(#[source] serde_json::Error),
    #[error("frame body is not a JSON object")]
    NotAnObject,
    #[error("frame carries neither an action nor a response code")]
    MissingDiscriminator,
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("invalid fields: {0}")]
    InvalidFields(#[source] serde_json::Error),
    #[error("unsupported response code {0}")]
    UnknownStatus(u16),
    #[error("response {code} is missing its '{field}' payload")]
    MissingPayload { code: u16, field: &'static str },
}

impl ProtocolError {
    /// Content-level problems are answered with a 400 and the connection
    /// stays up; framing-level problems leave the byte stream in an unknown
    /// state and must close it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotAnObject
                | ProtocolError::MissingDiscriminator
                | ProtocolError::UnknownAction(_)
                | ProtocolError::InvalidFields(_)
                | ProtocolError::UnknownStatus(_)
                | ProtocolError::MissingPayload { .. }
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            Category::Data => ProtocolError::InvalidFields(err),
            Category::Io | Category::Syntax | Category::Eof => ProtocolError::Syntax(err),
        }
    }
}

/// Why the protocol handler refused a request. Every variant is answered
/// with a 400; [`RequestError::reply_text`] is what goes on the wire.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("identity '{0}' already has a live session")]
    IdentityConflict(String),
    #[error("identity '{0}' is not registered")]
    NotRegistered(String),
    #[error("{action} for '{identity}' from a connection not bound to it")]
    Unauthorized {
        action: &'static str,
        identity: String,
    },
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RequestError {
    pub fn reply_text(&self) -> &'static str {
        match self {
            RequestError::IdentityConflict(_) => "name in use",
            RequestError::NotRegistered(_) => "user not registered",
            RequestError::Unauthorized { .. } | RequestError::BadRequest(_) => "bad request",
            RequestError::Store(_) => "server error",
        }
    }
}

/// Failures of the peer-side transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr} after {attempts} attempts")]
    Connect { addr: String, attempts: u32 },
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("connection closed by the remote side")]
    Closed,
    #[error("server rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("transport is stopped")]
    Stopped,
}

impl TransportError {
    /// A rejection is an answer; everything else leaves the socket unusable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// Invalid startup parameters, reported before any socket is opened.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port {0} is outside the allowed range 1024-65535")]
    PortOutOfRange(u32),
    #[error("port '{0}' is not a number")]
    PortNotNumeric(String),
    #[error("invalid listen address '{0}'")]
    Address(String),
    #[error("display name must not be empty")]
    EmptyName,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("user '{0}' is not registered")]
    NotRegistered(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_syntax_errors_are_not_recoverable() {
        let err = serde_json::from_str::<serde_json::Value>("{\"action\":").unwrap_err();
        let err = ProtocolError::from(err);
        assert!(matches!(err, ProtocolError::Syntax(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn reply_text_hides_details() {
        let err = RequestError::Unauthorized {
            action: "get_contacts",
            identity: "bob".into(),
        };
        assert_eq!(err.reply_text(), "bad request");
        assert_eq!(
            RequestError::IdentityConflict("alice".into()).reply_text(),
            "name in use"
        );
    }

    #[test]
    fn rejection_is_the_only_non_fatal_transport_error() {
        assert!(!TransportError::Rejected("no".into()).is_fatal());
        assert!(TransportError::Timeout.is_fatal());
        assert!(TransportError::Closed.is_fatal());
    }
}
