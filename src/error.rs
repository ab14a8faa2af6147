//! Error taxonomy for the echo client.
//!
//! Transport errors come from the stream transport and are passed through
//! untouched. Protocol errors are raised by the echo engine when the bytes
//! coming back do not match what was sent.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a stream transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The operation was aborted because the connection was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Connection is not open")]
    NotConnected,

    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("IO error: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl TransportError {
    /// Cancellation follows an intentional disconnect and is never shown to a user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(Arc::new(e))
    }
}

/// Errors detected while verifying an echo.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown echo failure")]
    Unknown,

    #[error("Received data does not match the data sent")]
    MismatchedData,

    #[error("Stream ended before all echoed data arrived")]
    InsufficientData,

    #[error("Too many empty reads while waiting for echoed data")]
    TooManyNilReads,
}

/// Terminal failure of one echo transaction.
#[derive(Error, Debug, Clone)]
pub enum EchoError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl EchoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EchoError::Transport(_) => ErrorKind::Transport,
            EchoError::Protocol(e) => ErrorKind::Protocol(*e),
        }
    }
}

/// Category of a reported error, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol(ProtocolError),
}

/// Endpoint validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    #[error("Host must not be empty")]
    EmptyHost,

    #[error("Port {0} is outside 1..=65535")]
    PortOutOfRange(i64),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Reasons a connect request was rejected.
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("Already connected")]
    AlreadyConnected,

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(#[from] EndpointError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Session(#[from] ClientError),
}

/// The session task behind an `EchoClient` is gone.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Echo session has shut down")]
pub struct ClientError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_error_kind() {
        let err = EchoError::from(ProtocolError::MismatchedData);
        assert_eq!(err.kind(), ErrorKind::Protocol(ProtocolError::MismatchedData));

        let err = EchoError::from(TransportError::NotConnected);
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_transport_error_passthrough() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err = EchoError::from(TransportError::from(io_err));
        assert_eq!(err.to_string(), "IO error: reset by peer");
        assert!(!matches!(err, EchoError::Transport(ref t) if t.is_cancelled()));
        assert!(TransportError::Cancelled.is_cancelled());
    }
}
