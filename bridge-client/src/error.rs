//! Client error taxonomy. `Clone` so one disconnect reason can be delivered to every waiter.

use std::time::Duration;

use bridge_core::{EnvelopeError, OperationType, PairingError, RegisterError};

use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    /// Malformed or incompatible pairing payload. Raised before any connection attempt.
    #[error("invalid pairing: {0}")]
    InvalidPairing(#[from] PairingError),
    /// No active session, or the session ended while the call was pending.
    #[error("not connected")]
    NotConnected,
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: OperationType,
        after: Duration,
    },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("network error: {0}")]
    NetworkError(#[from] TransportError),
    /// The server answered, and the answer was an explicit failure.
    #[error("server error: {0}")]
    ServerError(String),
    /// Parameters rejected locally; nothing was sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<EnvelopeError> for ClientError {
    fn from(e: EnvelopeError) -> Self {
        match e {
            EnvelopeError::Server(msg) => ClientError::ServerError(msg),
            EnvelopeError::Encode(err) => ClientError::InvalidRequest(err.to_string()),
            other => ClientError::InvalidResponse(other.to_string()),
        }
    }
}

impl From<RegisterError> for ClientError {
    fn from(e: RegisterError) -> Self {
        ClientError::InvalidState(e.to_string())
    }
}
