//! Background readers for worker streams.
//!
//! Each stream gets one dedicated thread that owns the only buffered reader
//! on it and pushes complete lines (or raw chunks) into a bounded queue. The
//! adapter then waits on the queue with a timeout. Callers never read or
//! poll the raw stream themselves: a buffered reader sitting behind a
//! readiness check can swallow a second line while the check reports
//! nothing pending.

use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, TrySendError};
use tracing::trace;

use crate::error::AdapterError;

/// What a reader does when its queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Overflow {
    /// Wait for the consumer; the worker sees backpressure on its pipe.
    Block,
    /// Discard the line and count it. Only for diagnostic streams.
    Drop,
}

pub(crate) struct StreamQueue<T> {
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
    _reader: JoinHandle<()>,
}

impl<T> StreamQueue<T> {
    pub fn receiver(&self) -> Receiver<T> {
        self.rx.clone()
    }

    pub fn try_iter(&self) -> impl Iterator<Item = T> + '_ {
        self.rx.try_iter()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub(crate) type LineQueue = StreamQueue<String>;
pub(crate) type ChunkQueue = StreamQueue<Vec<u8>>;

pub(crate) fn spawn_line_reader<R>(
    name: String,
    stream: R,
    capacity: usize,
    overflow: Overflow,
) -> std::io::Result<LineQueue>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_count = Arc::clone(&dropped);
    let thread_name = name.clone();
    let reader = thread::Builder::new().name(thread_name).spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    let keep_going = match overflow {
                        Overflow::Block => tx.send(line).is_ok(),
                        Overflow::Drop => match tx.try_send(line) {
                            Ok(()) => true,
                            Err(TrySendError::Full(_)) => {
                                dropped_count.fetch_add(1, Ordering::Relaxed);
                                true
                            }
                            Err(TrySendError::Disconnected(_)) => false,
                        },
                    };
                    if !keep_going {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(reader = %name, error = %e, "stream reader stopped");
                    break;
                }
            }
        }
    })?;
    Ok(StreamQueue {
        rx,
        dropped,
        _reader: reader,
    })
}

/// Chunk reader for transports whose responses end without a newline
/// (an interactive prompt, for instance).
pub(crate) fn spawn_chunk_reader<R>(name: String, mut stream: R, capacity: usize) -> std::io::Result<ChunkQueue>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded(capacity.max(1));
    let thread_name = name.clone();
    let reader = thread::Builder::new().name(thread_name).spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(reader = %name, error = %e, "stream reader stopped");
                    break;
                }
            }
        }
    })?;
    Ok(StreamQueue {
        rx,
        dropped: Arc::new(AtomicU64::new(0)),
        _reader: reader,
    })
}

/// Result of one bounded wait on a queue.
pub(crate) enum Received<T> {
    Item(T),
    /// The reader thread ended: the stream hit EOF or failed.
    Closed,
}

/// Waits for the next item, polling in `poll` slices so `idle` can check
/// worker liveness between slices. Fails with `Timeout` after `timeout`.
pub(crate) fn recv_bounded<T>(
    rx: &Receiver<T>,
    timeout: Duration,
    poll: Duration,
    waiting_for: &str,
    mut idle: impl FnMut() -> Result<(), AdapterError>,
) -> Result<Received<T>, AdapterError> {
    let start = Instant::now();
    let mut polls = 0u32;
    loop {
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(AdapterError::Timeout {
                waiting_for: waiting_for.to_string(),
                elapsed,
                polls,
            });
        }
        polls += 1;
        let slice = poll.min(timeout - elapsed).max(Duration::from_millis(1));
        match rx.recv_timeout(slice) {
            Ok(item) => return Ok(Received::Item(item)),
            Err(RecvTimeoutError::Disconnected) => return Ok(Received::Closed),
            Err(RecvTimeoutError::Timeout) => idle()?,
        }
    }
}
