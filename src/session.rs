//! Sequential execution context for the echo client.
//!
//! One task owns the [`Controller`] and processes, one at a time and in
//! this priority order:
//! - unsolicited transport events
//! - operation completions
//! - commands from [`EchoClient`] handles
//!
//! Transport operations run as their own tasks and post their completion
//! back to this queue, so state is never touched from two places at once and
//! a disconnect can land while a read or write is still pending.

use crate::controller::{
    Completion, Controller, EchoOutcome, Operation, OperationKind, OperationResult, Step,
};
use crate::error::{ClientError, ConnectError};
use crate::status::{Reporter, Status};
use crate::transport::{StreamTransport, TaggedEvent};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Depth of the command queue shared by all client handles.
const COMMAND_QUEUE_DEPTH: usize = 64;

enum Command {
    Connect {
        host: String,
        port: Option<i64>,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Echo {
        payload: Bytes,
        reply: oneshot::Sender<EchoOutcome>,
    },
}

/// Cloneable handle to a running echo session.
#[derive(Clone)]
pub struct EchoClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<Status>,
}

impl EchoClient {
    /// Start a session on the current tokio runtime.
    ///
    /// The session stops, cancelling any connection, once every handle has
    /// been dropped.
    pub fn spawn<T: StreamTransport>(
        transport: Arc<T>,
        reporter: Arc<dyn Reporter>,
    ) -> (Self, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(Status::Disconnected);

        let session = Session {
            controller: Controller::new(Arc::clone(&transport), reporter, events_tx),
            transport,
            commands: commands_rx,
            events: events_rx,
            completions: completions_rx,
            completions_tx,
            status: status_tx,
            waiting: None,
        };
        let task = tokio::spawn(session.run());

        (
            Self {
                commands: commands_tx,
                status: status_rx,
            },
            task,
        )
    }

    /// Connect to `host`/`port`; a missing or zero port means the echo port.
    pub async fn connect(&self, host: &str, port: Option<i64>) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            host: host.to_string(),
            port,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError)?
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Disconnect { reply }).await?;
        rx.await.map_err(|_| ClientError)
    }

    /// Echo `payload` and wait for the transaction to end.
    pub async fn echo(&self, payload: impl Into<Bytes>) -> Result<EchoOutcome, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Echo {
            payload: payload.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ClientError)
    }

    pub fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub fn can_echo(&self) -> bool {
        self.status().can_echo()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Watch the status; the receiver sees every settled change.
    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.status.clone()
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands.send(command).await.map_err(|_| ClientError)
    }
}

struct Session<T: StreamTransport> {
    controller: Controller<T>,
    transport: Arc<T>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<TaggedEvent>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    status: watch::Sender<Status>,
    /// Caller waiting on the running transaction.
    waiting: Option<oneshot::Sender<EchoOutcome>>,
}

impl<T: StreamTransport> Session<T> {
    async fn run(mut self) {
        debug!("Echo session started");

        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => {
                    let step = self.controller.on_transport_event(event);
                    self.drive(step);
                }
                Some(completion) = self.completions.recv() => {
                    let step = self.controller.complete(completion);
                    self.drive(step);
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
            self.status.send_replace(self.controller.status());
        }

        let step = self.controller.disconnect();
        self.drive(step);
        self.status.send_replace(self.controller.status());
        debug!("Echo session stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { host, port, reply } => {
                let result = self.controller.connect(&host, port);
                if let Err(e) = &result {
                    debug!(error = %e, "Connect rejected");
                }
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                let step = self.controller.disconnect();
                self.drive(step);
                let _ = reply.send(());
            }
            Command::Echo { payload, reply } => match self.controller.begin_echo(payload) {
                Step::Run(operation) => {
                    self.waiting = Some(reply);
                    self.spawn(operation);
                }
                Step::Finished(outcome) => {
                    let _ = reply.send(outcome);
                }
                Step::Nothing => {
                    let _ = reply.send(EchoOutcome::NotStarted);
                }
            },
        }
    }

    fn drive(&mut self, step: Step<T::Handle>) {
        match step {
            Step::Run(operation) => self.spawn(operation),
            Step::Finished(outcome) => {
                if let Some(waiting) = self.waiting.take() {
                    // The caller may have stopped waiting.
                    let _ = waiting.send(outcome);
                }
            }
            Step::Nothing => {}
        }
    }

    /// Run one transport operation off the queue and post its completion back.
    fn spawn(&self, operation: Operation<T::Handle>) {
        let transport = Arc::clone(&self.transport);
        let completions = self.completions_tx.clone();

        tokio::spawn(async move {
            let Operation {
                generation,
                handle,
                timeout,
                kind,
            } = operation;

            let result = match kind {
                OperationKind::Write(data) => {
                    trace!(generation, len = data.len(), "Write");
                    OperationResult::Write(transport.write(&handle, data, timeout).await)
                }
                OperationKind::Read { min_len, max_len } => {
                    trace!(generation, min_len, max_len, "Read");
                    OperationResult::Read(transport.read(&handle, min_len, max_len, timeout).await)
                }
            };

            let _ = completions.send(Completion { generation, result });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, ProtocolError, TransportError};
    use crate::status::{ChannelReporter, StatusEvent};
    use crate::transport::scripted::{Scripted, ScriptedTransport};
    use crate::transport::{ReadChunk, TcpTransport, TcpTransportOptions};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    fn scripted() -> (
        EchoClient,
        Arc<ScriptedTransport>,
        mpsc::UnboundedReceiver<StatusEvent>,
    ) {
        let transport = Arc::new(ScriptedTransport::new());
        let (reporter, reports) = ChannelReporter::new();
        let (client, _task) = EchoClient::spawn(Arc::clone(&transport), Arc::new(reporter));
        (client, transport, reports)
    }

    fn drain(reports: &mut mpsc::UnboundedReceiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = reports.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_chunked_echo() {
        let (client, transport, mut reports) = scripted();
        assert_ok!(client.connect("echo.test", None).await);
        assert!(client.can_echo());

        transport.push_chunks(&[b"a", b"b", b"c"]);
        let outcome = client.echo("abc").await.unwrap();
        assert!(outcome.is_echoed());
        assert_eq!(client.status(), Status::Idle);

        assert_eq!(transport.written(), vec![(1, Bytes::from_static(b"abc"))]);
        assert_eq!(
            transport.read_requests(),
            vec![(1, 1, 3), (1, 1, 2), (1, 1, 1)]
        );
        assert!(drain(&mut reports).iter().all(|e| e.error.is_none()));
    }

    #[tokio::test]
    async fn test_mismatched_echo() {
        let (client, transport, mut reports) = scripted();
        client.connect("echo.test", Some(7)).await.unwrap();

        transport.push_chunks(&[b"abd"]);
        match client.echo("abc").await.unwrap() {
            EchoOutcome::Failed(e) => {
                assert_eq!(e.kind(), ErrorKind::Protocol(ProtocolError::MismatchedData))
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(client.status(), Status::ErrorWhileReceiving);

        let last = drain(&mut reports).pop().unwrap();
        assert_eq!(last.status, Status::ErrorWhileReceiving);

        // recover without reconnecting
        transport.push_chunks(&[b"abc"]);
        assert!(client.echo("abc").await.unwrap().is_echoed());
        assert_eq!(client.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_short_echo_then_eof() {
        let (client, transport, _reports) = scripted();
        client.connect("echo.test", None).await.unwrap();

        transport.push_chunks(&[b"ab"]);
        transport.push_read(Scripted::Ready(Ok(ReadChunk::eof())));
        match client.echo("abc").await.unwrap() {
            EchoOutcome::Failed(e) => {
                assert_eq!(e.kind(), ErrorKind::Protocol(ProtocolError::InsufficientData))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unresponsive_peer() {
        let (client, transport, _reports) = scripted();
        client.connect("echo.test", None).await.unwrap();

        // unscripted reads are nil reads
        match client.echo("abc").await.unwrap() {
            EchoOutcome::Failed(e) => {
                assert_eq!(e.kind(), ErrorKind::Protocol(ProtocolError::TooManyNilReads))
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(transport.read_requests().len(), 21);
    }

    #[tokio::test]
    async fn test_echo_requires_connection() {
        let (client, transport, _reports) = scripted();
        assert!(matches!(
            client.echo("abc").await.unwrap(),
            EchoOutcome::NotStarted
        ));
        assert!(transport.written().is_empty());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_while_sending() {
        let (client, transport, mut reports) = scripted();
        client.connect("echo.test", None).await.unwrap();
        transport.push_write(Scripted::UntilCancelled);

        let mut status = client.subscribe();
        let echo = {
            let client = client.clone();
            tokio::spawn(async move { client.echo("abc").await })
        };
        assert_ok!(status.wait_for(|s| *s == Status::Sending).await);

        client.disconnect().await.unwrap();
        assert!(matches!(echo.await.unwrap().unwrap(), EchoOutcome::Aborted));
        assert_eq!(client.status(), Status::Disconnected);

        // give the cancelled write time to report back
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.status(), Status::Disconnected);

        let reports = drain(&mut reports);
        assert!(reports.iter().all(|e| e.error.is_none()));
        assert!(!reports.iter().any(|e| e.status == Status::ErrorWhileSending));
        assert_eq!(transport.cancelled(), vec![1]);
    }

    #[tokio::test]
    async fn test_transport_failure_while_idle() {
        let (client, transport, mut reports) = scripted();
        client.connect("echo.test", None).await.unwrap();
        drain(&mut reports);

        let mut status = client.subscribe();
        let sink = transport.last_sink().unwrap();
        sink.completed(Some(TransportError::NotConnected));
        assert_ok!(status.wait_for(|s| *s == Status::Disconnected).await);

        let reports = drain(&mut reports);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].error, Some(ErrorKind::Transport));

        // connect works again after the failure
        assert_ok!(client.connect("echo.test", None).await);
        assert_eq!(transport.opened(), vec![(1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn test_better_route_swaps_connection() {
        let (client, transport, _reports) = scripted();
        client.connect("echo.test", None).await.unwrap();

        transport.last_sink().unwrap().better_route();
        // the echo is queued behind the route event
        transport.push_chunks(&[b"hi"]);
        assert!(client.echo("hi").await.unwrap().is_echoed());

        assert_eq!(transport.cancelled(), vec![1]);
        assert_eq!(transport.written(), vec![(2, Bytes::from_static(b"hi"))]);
        assert_eq!(client.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_dropping_client_stops_session() {
        let transport = Arc::new(ScriptedTransport::new());
        let (reporter, _reports) = ChannelReporter::new();
        let (client, task) = EchoClient::spawn(Arc::clone(&transport), Arc::new(reporter));
        client.connect("echo.test", None).await.unwrap();

        drop(client);
        task.await.unwrap();
        assert_eq!(transport.cancelled(), vec![1]);
    }

    #[tokio::test]
    async fn test_echo_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 256];
            loop {
                let n = match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                // echo back one byte at a time to force reassembly
                for byte in &buf[..n] {
                    if socket.write_all(&[*byte]).await.is_err() {
                        return;
                    }
                    socket.flush().await.ok();
                }
            }
        });

        let transport = Arc::new(TcpTransport::new(TcpTransportOptions {
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }));
        let (reporter, _reports) = ChannelReporter::new();
        let (client, _task) = EchoClient::spawn(transport, Arc::new(reporter));

        client
            .connect("127.0.0.1", Some(port as i64))
            .await
            .unwrap();
        assert!(client.echo("hello, echo").await.unwrap().is_echoed());
        assert!(client.echo("again").await.unwrap().is_echoed());
        client.disconnect().await.unwrap();
        assert_eq!(client.status(), Status::Disconnected);
    }

    #[tokio::test]
    async fn test_tcp_peer_closes_early() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            let _ = socket.read_exact(&mut buf).await;
            let _ = socket.write_all(&buf[..2]).await;
        });

        let transport = Arc::new(TcpTransport::new(TcpTransportOptions::default()));
        let (reporter, _reports) = ChannelReporter::new();
        let (client, _task) = EchoClient::spawn(transport, Arc::new(reporter));
        client
            .connect("127.0.0.1", Some(port as i64))
            .await
            .unwrap();

        match client.echo("abc").await.unwrap() {
            EchoOutcome::Failed(e) => {
                assert_eq!(e.kind(), ErrorKind::Protocol(ProtocolError::InsufficientData))
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(client.status(), Status::ErrorWhileReceiving);
    }

    #[tokio::test]
    async fn test_tcp_connection_refused() {
        // Bind then drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = Arc::new(TcpTransport::new(TcpTransportOptions::default()));
        let (reporter, mut reports) = ChannelReporter::new();
        let (client, _task) = EchoClient::spawn(transport, Arc::new(reporter));

        // opening is lazy, so the connect itself is accepted
        assert_ok!(client.connect("127.0.0.1", Some(port as i64)).await);
        assert_eq!(client.status(), Status::Idle);

        match client.echo("abc").await.unwrap() {
            EchoOutcome::Failed(e) => assert_eq!(e.kind(), ErrorKind::Transport),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(client.status(), Status::Disconnected);

        let reports = drain(&mut reports);
        assert!(reports
            .iter()
            .all(|e| e.status != Status::ErrorWhileSending));
        let last = reports.last().unwrap();
        assert_eq!(last.status, Status::Disconnected);
        assert_eq!(last.error, Some(ErrorKind::Transport));
    }
}
