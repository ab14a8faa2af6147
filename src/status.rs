//! Connection status and the reporter contract.
//!
//! `Status` is the single source of truth for what a caller may do next.
//! Every status change and every terminal error is pushed to a [`Reporter`]
//! as a [`StatusEvent`]; nothing else leaves the core.

use crate::error::{EchoError, ErrorKind};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Aggregate state of the echo client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    /// No connection exists.
    #[default]
    Disconnected,
    /// Connected and ready for an echo.
    Idle,
    /// Writing the payload.
    Sending,
    /// The last echo failed while writing.
    ErrorWhileSending,
    /// Reading back and verifying the echo.
    Receiving,
    /// The last echo failed while reading or verifying.
    ErrorWhileReceiving,
}

impl Status {
    /// A new echo may start from here.
    pub fn can_echo(self) -> bool {
        matches!(
            self,
            Status::Idle | Status::ErrorWhileSending | Status::ErrorWhileReceiving
        )
    }

    pub fn is_connected(self) -> bool {
        self != Status::Disconnected
    }

    /// An echo transaction is in flight.
    pub fn is_transacting(self) -> bool {
        matches!(self, Status::Sending | Status::Receiving)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Disconnected => "disconnected",
            Status::Idle => "idle",
            Status::Sending => "sending",
            Status::ErrorWhileSending => "error while sending",
            Status::Receiving => "receiving",
            Status::ErrorWhileReceiving => "error while receiving",
        };
        f.write_str(s)
    }
}

/// What a reporter receives on every status change or terminal error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub status: Status,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
}

impl StatusEvent {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            error: None,
            message: None,
        }
    }

    pub fn failure(status: Status, error: &EchoError) -> Self {
        Self {
            status,
            error: Some(error.kind()),
            message: Some(error.to_string()),
        }
    }
}

/// Sink for status events, implemented by whatever renders them.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &StatusEvent);
}

/// Renders status events into the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: &StatusEvent) {
        match (&event.error, &event.message) {
            (Some(kind), message) => warn!(
                status = %event.status,
                error = ?kind,
                detail = message.as_deref().unwrap_or(""),
                "Echo error"
            ),
            (None, _) => info!(status = %event.status, "Status changed"),
        }
    }
}

/// Forwards status events over a channel, for hosts that render elsewhere.
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn report(&self, event: &StatusEvent) {
        // Receiver gone means nobody is rendering any more.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_derived_queries() {
        assert!(!Status::Disconnected.is_connected());
        assert!(!Status::Disconnected.can_echo());

        for status in [
            Status::Idle,
            Status::ErrorWhileSending,
            Status::ErrorWhileReceiving,
        ] {
            assert!(status.can_echo());
            assert!(status.is_connected());
            assert!(!status.is_transacting());
        }

        for status in [Status::Sending, Status::Receiving] {
            assert!(!status.can_echo());
            assert!(status.is_connected());
            assert!(status.is_transacting());
        }
    }

    #[test]
    fn test_channel_reporter() {
        let (reporter, mut rx) = ChannelReporter::new();
        reporter.report(&StatusEvent::status(Status::Idle));
        reporter.report(&StatusEvent::failure(
            Status::ErrorWhileReceiving,
            &EchoError::from(ProtocolError::InsufficientData),
        ));

        assert_eq!(rx.try_recv().unwrap(), StatusEvent::status(Status::Idle));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.status, Status::ErrorWhileReceiving);
        assert_eq!(
            event.error,
            Some(ErrorKind::Protocol(ProtocolError::InsufficientData))
        );
        assert!(event.message.is_some());
    }
}
