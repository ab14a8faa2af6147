//! Connection lifecycle controller and echo transaction steps.
//!
//! The controller owns the current connection, the aggregate [`Status`]
//! and, while a transaction runs, the [`PendingEcho`]. It never awaits
//! anything itself: every method takes one input (a request, an operation
//! completion or a transport event) and returns a [`Step`] telling the
//! caller which transport operation to run next, if any.
//!
//! ```text
//!  Disconnected --connect--> Idle --echo--> Sending --ok--> Receiving --done--> Idle
//!                                              |                |
//!                                              v                v
//!                                     ErrorWhileSending   ErrorWhileReceiving
//! ```
//!
//! Each connection gets a fresh generation number. Operation completions
//! and transport events carry the generation they were issued for, and are
//! dropped unless it matches the live connection.

use crate::endpoint::Endpoint;
use crate::engine::{PendingEcho, Progress};
use crate::error::{ConnectError, EchoError, ProtocolError, TransportError};
use crate::status::{Reporter, Status, StatusEvent};
use crate::transport::{EventSink, ReadChunk, StreamTransport, TaggedEvent, TransportEvent};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

/// A transport operation the caller must run and report back.
#[derive(Debug, Clone)]
pub struct Operation<H> {
    pub generation: u64,
    pub handle: H,
    pub timeout: Duration,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Write(Bytes),
    Read { min_len: usize, max_len: usize },
}

/// Result of a finished operation, tagged with its generation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub generation: u64,
    pub result: OperationResult,
}

#[derive(Debug, Clone)]
pub enum OperationResult {
    Write(Result<(), TransportError>),
    Read(Result<ReadChunk, TransportError>),
}

/// How an echo request ended.
#[derive(Debug, Clone)]
pub enum EchoOutcome {
    /// Every byte came back intact.
    Echoed,
    Failed(EchoError),
    /// Ended by disconnect, cancellation or a superseded connection.
    Aborted,
    /// Not started: no connection, a transaction already running, or an
    /// empty payload.
    NotStarted,
}

impl EchoOutcome {
    pub fn is_echoed(&self) -> bool {
        matches!(self, EchoOutcome::Echoed)
    }
}

/// What the driver should do after feeding the controller an input.
#[derive(Debug)]
pub enum Step<H> {
    Run(Operation<H>),
    Finished(EchoOutcome),
    Nothing,
}

struct Connection<H> {
    generation: u64,
    handle: H,
    endpoint: Endpoint,
}

/// Owns the connection and status; the single writer of both.
pub struct Controller<T: StreamTransport> {
    transport: Arc<T>,
    reporter: Arc<dyn Reporter>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    connection: Option<Connection<T::Handle>>,
    status: Status,
    pending: Option<PendingEcho>,
    last_generation: u64,
}

impl<T: StreamTransport> Controller<T> {
    pub fn new(
        transport: Arc<T>,
        reporter: Arc<dyn Reporter>,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            transport,
            reporter,
            events,
            connection: None,
            status: Status::Disconnected,
            pending: None,
            last_generation: 0,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.connection.as_ref().map(|c| &c.endpoint)
    }

    /// Generation of the live connection, if any.
    pub fn generation(&self) -> Option<u64> {
        self.connection.as_ref().map(|c| c.generation)
    }

    pub fn pending(&self) -> Option<&PendingEcho> {
        self.pending.as_ref()
    }

    /// Open a connection to `host`/`port`.
    ///
    /// Rejected without any state change when already connected or when the
    /// endpoint is invalid.
    pub fn connect(&mut self, host: &str, port: Option<i64>) -> Result<(), ConnectError> {
        if self.connection.is_some() {
            return Err(ConnectError::AlreadyConnected);
        }
        let endpoint = Endpoint::new(host, port)?;

        let generation = self.next_generation();
        let sink = EventSink::new(generation, self.events.clone());
        let handle = self.transport.open(&endpoint, sink)?;

        info!(endpoint = %endpoint, generation, "Connected");
        self.connection = Some(Connection {
            generation,
            handle,
            endpoint,
        });
        self.set_status(Status::Idle);
        Ok(())
    }

    /// Cancel and release the connection. A no-op when disconnected.
    pub fn disconnect(&mut self) -> Step<T::Handle> {
        let Some(connection) = self.connection.take() else {
            return Step::Nothing;
        };

        info!(endpoint = %connection.endpoint, generation = connection.generation, "Disconnecting");
        self.transport.cancel(&connection.handle);
        self.release(None)
    }

    /// Start an echo of `payload`.
    ///
    /// A no-op unless the status allows a new echo and the payload is
    /// non-empty.
    pub fn begin_echo(&mut self, payload: Bytes) -> Step<T::Handle> {
        if !self.status.can_echo() || payload.is_empty() {
            debug!(status = %self.status, len = payload.len(), "Echo not started");
            return Step::Finished(EchoOutcome::NotStarted);
        }
        let Some(connection) = self.connection.as_ref() else {
            return Step::Finished(EchoOutcome::NotStarted);
        };

        let operation = Operation {
            generation: connection.generation,
            handle: connection.handle.clone(),
            timeout: self.transport.request_timeout(),
            kind: OperationKind::Write(payload.clone()),
        };

        trace!(len = payload.len(), "Sending echo payload");
        self.pending = Some(PendingEcho::new(payload));
        self.set_status(Status::Sending);
        Step::Run(operation)
    }

    /// Feed back the result of an operation returned by an earlier step.
    pub fn complete(&mut self, completion: Completion) -> Step<T::Handle> {
        if self.generation() != Some(completion.generation) {
            trace!(generation = completion.generation, "Dropping stale completion");
            return Step::Nothing;
        }

        match (self.status, completion.result) {
            (Status::Sending, OperationResult::Write(result)) => self.on_write(result),
            (Status::Receiving, OperationResult::Read(result)) => self.on_read(result),
            (status, result) => {
                trace!(%status, ?result, "Dropping completion that does not fit the current status");
                Step::Nothing
            }
        }
    }

    /// React to an unsolicited transport notification.
    pub fn on_transport_event(&mut self, tagged: TaggedEvent) -> Step<T::Handle> {
        if self.generation() != Some(tagged.generation) {
            trace!(generation = tagged.generation, "Dropping stale transport event");
            return Step::Nothing;
        }

        match tagged.event {
            TransportEvent::Completed(error) => {
                debug!(?error, "Connection completed");
                self.connection = None;
                // Without a cause the connection still died under us.
                let error = match error {
                    Some(e) if e.is_cancelled() => None,
                    Some(e) => Some(EchoError::from(e)),
                    None => Some(EchoError::from(ProtocolError::Unknown)),
                };
                self.release(error)
            }
            TransportEvent::BetterRoute => {
                self.on_better_route();
                Step::Nothing
            }
        }
    }

    fn on_write(&mut self, result: Result<(), TransportError>) -> Step<T::Handle> {
        match result {
            Ok(()) => {
                self.set_status(Status::Receiving);
                match self.pending.as_ref().map(PendingEcho::progress) {
                    Some(progress) => self.advance(progress),
                    None => self.fail(Status::ErrorWhileReceiving, ProtocolError::Unknown.into()),
                }
            }
            Err(e) if e.is_cancelled() => self.abandon(),
            Err(e) => self.fail(Status::ErrorWhileSending, e.into()),
        }
    }

    fn on_read(&mut self, result: Result<ReadChunk, TransportError>) -> Step<T::Handle> {
        let chunk = match result {
            Ok(chunk) => chunk,
            Err(e) if e.is_cancelled() => return self.abandon(),
            Err(e) => return self.fail(Status::ErrorWhileReceiving, e.into()),
        };

        let Some(pending) = self.pending.as_mut() else {
            return self.fail(Status::ErrorWhileReceiving, ProtocolError::Unknown.into());
        };

        match pending.on_read(chunk) {
            Ok(progress) => self.advance(progress),
            Err(e) => self.fail(Status::ErrorWhileReceiving, e.into()),
        }
    }

    /// Issue the next read, or finish successfully once nothing is left.
    fn advance(&mut self, progress: Progress) -> Step<T::Handle> {
        match progress {
            Progress::Complete => {
                self.pending = None;
                self.set_status(Status::Idle);
                Step::Finished(EchoOutcome::Echoed)
            }
            Progress::ReadMore(max_len) => {
                // re-read the connection so a closed one is noticed here
                let Some(connection) = self.connection.as_ref() else {
                    return self.fail(Status::ErrorWhileReceiving, TransportError::NotConnected.into());
                };
                Step::Run(Operation {
                    generation: connection.generation,
                    handle: connection.handle.clone(),
                    timeout: self.transport.request_timeout(),
                    kind: OperationKind::Read { min_len: 1, max_len },
                })
            }
        }
    }

    fn fail(&mut self, status: Status, error: EchoError) -> Step<T::Handle> {
        self.pending = None;
        self.status = status;
        self.reporter.report(&StatusEvent::failure(status, &error));
        Step::Finished(EchoOutcome::Failed(error))
    }

    /// A cancelled operation on the live connection: the connection is gone
    /// but nobody needs to hear about it.
    fn abandon(&mut self) -> Step<T::Handle> {
        self.connection = None;
        self.release(None)
    }

    fn on_better_route(&mut self) {
        if self.status.is_transacting() {
            debug!(status = %self.status, "Ignoring better route during a transaction");
            return;
        }
        if self.connection.is_none() {
            return;
        }

        let generation = self.next_generation();
        let sink = EventSink::new(generation, self.events.clone());
        let Some(current) = self.connection.as_ref() else {
            return;
        };
        let handle = match self.transport.migrate(&current.handle, sink) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(error = %e, "Better route could not be opened");
                return;
            }
        };

        let endpoint = current.endpoint.clone();
        if let Some(old) = self.connection.replace(Connection {
            generation,
            handle,
            endpoint,
        }) {
            self.transport.cancel(&old.handle);
        }
        info!(generation, "Switched to better route");
        self.set_status(Status::Idle);
    }

    /// Drop into `Disconnected` after the connection has been taken away.
    ///
    /// `None` releases silently; an error is reported and handed to the
    /// caller of an in-flight echo.
    fn release(&mut self, error: Option<EchoError>) -> Step<T::Handle> {
        let was_transacting = self.pending.take().is_some();
        self.status = Status::Disconnected;

        let event = match &error {
            Some(e) => StatusEvent::failure(Status::Disconnected, e),
            None => StatusEvent::status(Status::Disconnected),
        };
        self.reporter.report(&event);

        if !was_transacting {
            return Step::Nothing;
        }
        match error {
            Some(e) => Step::Finished(EchoOutcome::Failed(e)),
            None => Step::Finished(EchoOutcome::Aborted),
        }
    }

    fn set_status(&mut self, status: Status) {
        if self.status != status {
            trace!(from = %self.status, to = %status, "Status transition");
            self.status = status;
            self.reporter.report(&StatusEvent::status(status));
        }
    }

    fn next_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }
}
