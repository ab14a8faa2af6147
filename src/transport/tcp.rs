//! TCP stream transport over tokio.
//!
//! Connections are opened lazily: `open` only records the endpoint, and the
//! socket is connected by the first read or write. A failed connect is
//! returned to that operation and also posted as `Completed(Some(error))`,
//! since the connection is unusable from then on.
//!
//! A read that times out without receiving anything is a nil read, not an
//! error. A write that times out is an error.

use super::{EventSink, ReadChunk, StreamTransport};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, trace};

/// Largest buffer a single read allocates, whatever the caller asks for.
const MAX_READ_CHUNK: usize = 64 * 1024;

/// Tunables for [`TcpTransport`].
#[derive(Debug, Clone)]
pub struct TcpTransportOptions {
    /// Per-operation read/write timeout.
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// TCP keepalive idle time; `None` leaves keepalive off.
    pub keepalive: Option<Duration>,
    pub nodelay: bool,
}

impl Default for TcpTransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            keepalive: Some(Duration::from_secs(30)),
            nodelay: true,
        }
    }
}

/// Plain TCP implementation of [`StreamTransport`].
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    options: TcpTransportOptions,
}

impl TcpTransport {
    pub fn new(options: TcpTransportOptions) -> Self {
        Self { options }
    }
}

/// Handle to one lazily connected TCP stream.
#[derive(Clone)]
pub struct TcpHandle {
    inner: Arc<TcpConnection>,
}

impl fmt::Debug for TcpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpHandle")
            .field("endpoint", &self.inner.endpoint)
            .field("generation", &self.inner.events.generation())
            .finish()
    }
}

struct TcpConnection {
    endpoint: Endpoint,
    stream: Mutex<Option<TcpStream>>,
    cancelled: watch::Sender<bool>,
    events: EventSink,
}

impl TcpConnection {
    fn new(endpoint: Endpoint, events: EventSink) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            endpoint,
            stream: Mutex::new(None),
            cancelled,
            events,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the connection has been cancelled.
    async fn wait_cancelled(&self) {
        let mut rx = self.cancelled.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Lock the stream, connecting it first if this is the first operation.
    async fn stream(
        &self,
        options: &TcpTransportOptions,
    ) -> Result<MutexGuard<'_, Option<TcpStream>>, TransportError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = match self.connect(options).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.events.completed(Some(e.clone()));
                    return Err(e);
                }
            };
            *guard = Some(stream);
        }
        Ok(guard)
    }

    async fn connect(&self, options: &TcpTransportOptions) -> Result<TcpStream, TransportError> {
        let addr = (self.endpoint.host(), self.endpoint.port());
        let stream = match tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    endpoint: self.endpoint.to_string(),
                    source: Arc::new(e),
                })
            }
            Err(_) => return Err(TransportError::TimedOut(options.connect_timeout)),
        };

        stream.set_nodelay(options.nodelay)?;
        if let Some(idle) = options.keepalive {
            SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }

        debug!(endpoint = %self.endpoint, "TCP connection established");
        Ok(stream)
    }

    async fn write_all(
        &self,
        data: &[u8],
        timeout: Duration,
        options: &TcpTransportOptions,
    ) -> Result<(), TransportError> {
        let mut guard = self.stream(options).await?;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        match tokio::time::timeout(timeout, stream.write_all(data)).await {
            Ok(result) => {
                result?;
                trace!(len = data.len(), "Wrote payload");
                Ok(())
            }
            Err(_) => Err(TransportError::TimedOut(timeout)),
        }
    }

    async fn read_chunk(
        &self,
        min_len: usize,
        max_len: usize,
        timeout: Duration,
        options: &TcpTransportOptions,
    ) -> Result<ReadChunk, TransportError> {
        let mut guard = self.stream(options).await?;
        let stream = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let deadline = tokio::time::Instant::now() + timeout;
        let capacity = max_len.min(MAX_READ_CHUNK);
        let mut buf = vec![0u8; capacity];
        let mut filled = 0;
        let mut eof = false;

        while filled < min_len && filled < capacity {
            match tokio::time::timeout_at(deadline, stream.read(&mut buf[filled..])).await {
                Ok(Ok(0)) => {
                    eof = true;
                    break;
                }
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(e.into()),
                // Out of time: hand back whatever arrived, possibly nothing.
                Err(_) => break,
            }
        }

        trace!(filled, eof, "Read chunk");
        buf.truncate(filled);
        let data = if filled > 0 {
            Some(Bytes::from(buf))
        } else {
            None
        };
        Ok(ReadChunk { data, eof })
    }
}

#[async_trait]
impl StreamTransport for TcpTransport {
    type Handle = TcpHandle;

    fn request_timeout(&self) -> Duration {
        self.options.request_timeout
    }

    fn open(&self, endpoint: &Endpoint, events: EventSink) -> Result<TcpHandle, TransportError> {
        debug!(endpoint = %endpoint, generation = events.generation(), "Opening TCP connection");
        Ok(TcpHandle {
            inner: Arc::new(TcpConnection::new(endpoint.clone(), events)),
        })
    }

    /// TCP never announces a better route; a migration is a fresh connection
    /// to the same endpoint.
    fn migrate(&self, current: &TcpHandle, events: EventSink) -> Result<TcpHandle, TransportError> {
        self.open(&current.inner.endpoint, events)
    }

    async fn write(
        &self,
        handle: &TcpHandle,
        data: Bytes,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let conn = &handle.inner;
        if conn.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = conn.wait_cancelled() => Err(TransportError::Cancelled),
            result = conn.write_all(&data, timeout, &self.options) => result,
        }
    }

    async fn read(
        &self,
        handle: &TcpHandle,
        min_len: usize,
        max_len: usize,
        timeout: Duration,
    ) -> Result<ReadChunk, TransportError> {
        let conn = &handle.inner;
        if conn.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = conn.wait_cancelled() => Err(TransportError::Cancelled),
            result = conn.read_chunk(min_len, max_len, timeout, &self.options) => result,
        }
    }

    fn cancel(&self, handle: &TcpHandle) {
        let conn = &handle.inner;
        let was_cancelled = conn.cancelled.send_replace(true);
        if was_cancelled {
            return;
        }

        // Close the socket now unless an operation holds it; that operation
        // is aborted by the cancellation signal and the socket closes on drop.
        if let Ok(mut stream) = conn.stream.try_lock() {
            stream.take();
        }

        debug!(endpoint = %conn.endpoint, "TCP connection cancelled");
        conn.events.completed(Some(TransportError::Cancelled));
    }
}
