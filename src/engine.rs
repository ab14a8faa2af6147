//! Receive-and-verify logic of one echo transaction.
//!
//! `PendingEcho` tracks what is still expected back from the peer. It does
//! no I/O: the controller feeds it one read result at a time and it answers
//! with what to do next. Driving it this way keeps the receive loop
//! iterative no matter how many chunks the peer splits the echo into.

use crate::error::ProtocolError;
use crate::transport::ReadChunk;
use bytes::{Buf, Bytes};

/// Consecutive empty, non-EOF reads tolerated before giving up.
pub const NIL_READ_BUDGET: u32 = 20;

/// What the receive loop does after a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Issue another read of at most this many bytes.
    ReadMore(usize),
    /// Every byte came back intact.
    Complete,
}

/// In-flight transaction state.
#[derive(Debug, Clone)]
pub struct PendingEcho {
    original: Bytes,
    remaining: Bytes,
    nil_reads_left: u32,
}

impl PendingEcho {
    pub fn new(payload: Bytes) -> Self {
        Self {
            remaining: payload.clone(),
            original: payload,
            nil_reads_left: NIL_READ_BUDGET,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.original
    }

    /// Bytes still expected from the peer.
    pub fn remaining(&self) -> &[u8] {
        &self.remaining
    }

    pub fn nil_reads_left(&self) -> u32 {
        self.nil_reads_left
    }

    /// Next step before any read has happened.
    pub fn progress(&self) -> Progress {
        if self.remaining.is_empty() {
            Progress::Complete
        } else {
            Progress::ReadMore(self.remaining.len())
        }
    }

    /// Verify one read against the expected bytes.
    pub fn on_read(&mut self, chunk: ReadChunk) -> Result<Progress, ProtocolError> {
        match chunk.data {
            Some(data) if !data.is_empty() => {
                if !self.remaining.starts_with(&data) {
                    return Err(ProtocolError::MismatchedData);
                }
                self.remaining.advance(data.len());

                if chunk.eof && !self.remaining.is_empty() {
                    return Err(ProtocolError::InsufficientData);
                }
                // only consecutive nil reads count against the budget
                self.nil_reads_left = NIL_READ_BUDGET;
                Ok(self.progress())
            }
            _ => {
                if chunk.eof {
                    Err(ProtocolError::InsufficientData)
                } else if self.nil_reads_left == 0 {
                    Err(ProtocolError::TooManyNilReads)
                } else {
                    self.nil_reads_left -= 1;
                    Ok(self.progress())
                }
            }
        }
    }
}
