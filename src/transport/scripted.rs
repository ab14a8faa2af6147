//! In-memory transport that replays scripted operation results.

use super::{EventSink, ReadChunk, StreamTransport};
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// What a scripted write or read does when it runs.
#[derive(Debug, Clone)]
pub enum Scripted<T> {
    Ready(Result<T, TransportError>),
    /// Blocks until the connection is cancelled, then fails with `Cancelled`.
    UntilCancelled,
}

#[derive(Default)]
struct Script {
    writes: VecDeque<Scripted<()>>,
    reads: VecDeque<Scripted<ReadChunk>>,
    next_handle: u64,
    opened: Vec<(u64, u64)>,
    cancelled: Vec<u64>,
    written: Vec<(u64, Bytes)>,
    read_requests: Vec<(u64, usize, usize)>,
    sinks: Vec<EventSink>,
    fail_open: bool,
}

/// Transport whose handles are plain numbers and whose results come from a
/// queue. Unscripted writes succeed; unscripted reads are nil reads.
pub struct ScriptedTransport {
    script: Mutex<Script>,
    cancel_signal: watch::Sender<bool>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (cancel_signal, _) = watch::channel(false);
        Self {
            script: Mutex::new(Script::default()),
            cancel_signal,
        }
    }

    pub fn push_write(&self, result: Scripted<()>) {
        self.script.lock().unwrap().writes.push_back(result);
    }

    pub fn push_read(&self, result: Scripted<ReadChunk>) {
        self.script.lock().unwrap().reads.push_back(result);
    }

    /// Queue reads that hand back `chunks` one after another.
    pub fn push_chunks(&self, chunks: &[&'static [u8]]) {
        for chunk in chunks {
            self.push_read(Scripted::Ready(Ok(ReadChunk::data(Bytes::from_static(chunk)))));
        }
    }

    pub fn fail_open(&self) {
        self.script.lock().unwrap().fail_open = true;
    }

    /// `(handle, generation)` for every open or migrate.
    pub fn opened(&self) -> Vec<(u64, u64)> {
        self.script.lock().unwrap().opened.clone()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.script.lock().unwrap().cancelled.clone()
    }

    pub fn written(&self) -> Vec<(u64, Bytes)> {
        self.script.lock().unwrap().written.clone()
    }

    pub fn read_requests(&self) -> Vec<(u64, usize, usize)> {
        self.script.lock().unwrap().read_requests.clone()
    }

    /// Event sink handed over with the most recent open or migrate.
    pub fn last_sink(&self) -> Option<EventSink> {
        self.script.lock().unwrap().sinks.last().cloned()
    }

    fn register(&self, events: EventSink) -> Result<u64, TransportError> {
        let mut script = self.script.lock().unwrap();
        if script.fail_open {
            return Err(TransportError::NotConnected);
        }
        script.next_handle += 1;
        let handle = script.next_handle;
        script.opened.push((handle, events.generation()));
        script.sinks.push(events);
        Ok(handle)
    }

    async fn until_cancelled(&self) -> TransportError {
        let mut rx = self.cancel_signal.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
        TransportError::Cancelled
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    type Handle = u64;

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn open(&self, _endpoint: &Endpoint, events: EventSink) -> Result<u64, TransportError> {
        self.register(events)
    }

    fn migrate(&self, _current: &u64, events: EventSink) -> Result<u64, TransportError> {
        self.register(events)
    }

    async fn write(
        &self,
        handle: &u64,
        data: Bytes,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let next = {
            let mut script = self.script.lock().unwrap();
            script.written.push((*handle, data));
            script.writes.pop_front()
        };
        match next {
            Some(Scripted::Ready(result)) => result,
            Some(Scripted::UntilCancelled) => Err(self.until_cancelled().await),
            None => Ok(()),
        }
    }

    async fn read(
        &self,
        handle: &u64,
        min_len: usize,
        max_len: usize,
        _timeout: Duration,
    ) -> Result<ReadChunk, TransportError> {
        let next = {
            let mut script = self.script.lock().unwrap();
            script.read_requests.push((*handle, min_len, max_len));
            script.reads.pop_front()
        };
        match next {
            Some(Scripted::Ready(result)) => result,
            Some(Scripted::UntilCancelled) => Err(self.until_cancelled().await),
            None => Ok(ReadChunk::nil()),
        }
    }

    fn cancel(&self, handle: &u64) {
        self.script.lock().unwrap().cancelled.push(*handle);
        self.cancel_signal.send_replace(true);
    }
}
