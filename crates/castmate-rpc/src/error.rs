//! Error types for the bridge core
//!
//! Protocol-level problems are returned as [`BridgeError`] so callers can
//! log or assert on them. Only remote business failures reach a caller of
//! `call`, as [`CallError::Failed`].

use serde_json::Value;
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors raised when handing a frame to a transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No transport is currently attached
    #[error("transport not connected")]
    NotConnected,

    /// The transport was attached but its writer has gone away
    #[error("transport closed")]
    Closed,
}

/// Ways a call can settle other than a successful result
#[derive(Debug, Error)]
pub enum CallError {
    /// The remote handler failed. The detail is usually absent.
    #[error("remote call failed")]
    Failed { error: Option<Value> },

    /// No response arrived within the configured timeout
    #[error("call {token} timed out")]
    TimedOut { token: String },

    /// The outstanding call was dropped locally before any response arrived
    #[error("call abandoned before a response arrived")]
    Abandoned,

    /// The request could not be sent
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The result did not match the type the caller asked for
    #[error("failed to decode call result: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Named outcomes of inbound processing that are not normal settlement
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The frame text is not a valid envelope
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] ProtocolError),

    /// A binary frame arrived where only text is accepted
    #[error("non-text frame dropped")]
    NonTextFrame,

    /// A request named a method nobody registered. No response is sent.
    #[error("no handler registered for {0}")]
    UnknownMethod(String),

    /// A handler with this name is already registered
    #[error("RPC {0} already set")]
    DuplicateHandler(String),

    /// Release of a state that was never acquired
    #[error("state {namespace}.{key} is not acquired")]
    NotAcquired { namespace: String, key: String },

    /// A response could not be sent back
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_handler_message() {
        let err = BridgeError::DuplicateHandler("echo".to_string());
        assert_eq!(err.to_string(), "RPC echo already set");
    }

    #[test]
    fn test_malformed_frame_wraps_protocol_error() {
        let err: BridgeError = ProtocolError::NotAnObject.into();
        assert!(matches!(err, BridgeError::MalformedFrame(ProtocolError::NotAnObject)));
    }

    #[test]
    fn test_call_error_from_transport() {
        let err: CallError = TransportError::NotConnected.into();
        assert_eq!(err.to_string(), "transport not connected");
    }
}
