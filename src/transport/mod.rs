//! Stream transport contract.
//!
//! The echo core never touches sockets directly. It drives a
//! [`StreamTransport`], which opens byte-stream connections, performs timed
//! reads and writes, and posts unsolicited notifications through an
//! [`EventSink`]:
//! - `Completed`: the connection is finished (failed, closed or cancelled)
//! - `BetterRoute`: a better path exists for the same logical connection
//!
//! Every notification is tagged with the generation of the connection it
//! belongs to, so the controller can discard anything from a connection it
//! has already replaced or closed.

mod tcp;

#[cfg(test)]
pub(crate) mod scripted;

pub use tcp::{TcpHandle, TcpTransport, TcpTransportOptions};

use crate::endpoint::Endpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

/// Result of a single read.
///
/// `data` of `None` (or empty) with `eof == false` is a "nil read": the
/// peer is open but sent nothing within the timeout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadChunk {
    pub data: Option<Bytes>,
    pub eof: bool,
}

impl ReadChunk {
    pub fn data(bytes: impl Into<Bytes>) -> Self {
        Self {
            data: Some(bytes.into()),
            eof: false,
        }
    }

    pub fn eof() -> Self {
        Self {
            data: None,
            eof: true,
        }
    }

    pub fn nil() -> Self {
        Self::default()
    }
}

/// Unsolicited notification from a transport connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is no longer usable. `None` carries no specific cause
    /// and is still reported as an unknown failure; `Cancelled` is silent.
    Completed(Option<TransportError>),
    /// A better route is available for this connection.
    BetterRoute,
}

/// A transport event together with the generation it belongs to.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: TransportEvent,
}

/// Generation-tagged channel for one connection's notifications.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn completed(&self, error: Option<TransportError>) {
        self.send(TransportEvent::Completed(error));
    }

    pub fn better_route(&self) {
        self.send(TransportEvent::BetterRoute);
    }

    fn send(&self, event: TransportEvent) {
        // The session may already be gone; nothing left to notify.
        let _ = self.tx.send(TaggedEvent {
            generation: self.generation,
            event,
        });
    }
}

/// A byte-stream transport the echo client can drive.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    /// Opaque handle to one open connection.
    type Handle: Clone + Send + Sync + 'static;

    /// Timeout applied to every single read or write.
    fn request_timeout(&self) -> Duration;

    /// Open a connection. Opening may be lazy; the handle is not proven good
    /// until the first operation succeeds.
    fn open(&self, endpoint: &Endpoint, events: EventSink) -> Result<Self::Handle, TransportError>;

    /// Open the better-route replacement for `current` after a `BetterRoute`
    /// notification.
    fn migrate(
        &self,
        current: &Self::Handle,
        events: EventSink,
    ) -> Result<Self::Handle, TransportError>;

    async fn write(
        &self,
        handle: &Self::Handle,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Read at least `min_len` and at most `max_len` bytes, unless the
    /// stream ends or the timeout passes first.
    async fn read(
        &self,
        handle: &Self::Handle,
        min_len: usize,
        max_len: usize,
        timeout: Duration,
    ) -> Result<ReadChunk, TransportError>;

    /// Cancel the connection. In-flight operations fail with
    /// [`TransportError::Cancelled`].
    fn cancel(&self, handle: &Self::Handle);
}
