//! Byte-stream adapter over a request/response [`Channel`].
//!
//! # Overview
//!
//! - [`WriteHalf`] buffers written bytes and sends each full buffer (or an
//!   explicit flush) as one request.
//! - [`ReadHalf`] drains responses strictly in submission order, blocking on
//!   the oldest request until the channel resolves it. Failed requests are
//!   skipped; their bytes are lost.
//! - Because the protocol is pull-based, a read with nothing outstanding sends
//!   an empty request to ask the other side for data.
//!
//! End of stream is only ever reported after [`ReadHalf::close`].
//!
//! # Example
//!
//! ```
//! use std::io::{Read, Write};
//! use pullstream::{ClientStream, StreamConfig};
//! use pullstream::channel::loopback::LoopbackChannel;
//!
//! let config = StreamConfig { write_buffer_size: 4, ..StreamConfig::default() };
//! let mut stream = ClientStream::connect(config, LoopbackChannel::echo).unwrap();
//!
//! stream.write_all(b"ping").unwrap();
//! let mut buf = [0u8; 4];
//! stream.read_exact(&mut buf).unwrap();
//! assert_eq!(&buf, b"ping");
//! ```

use std::io::{self, Read, Write};
use std::mem;
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};

use crate::channel::{Channel, Responder};
use crate::config::{ConfigError, StreamConfig, Timeout};
use crate::registry::{Shared, StreamClosed, StreamStats, Submitted};
use crate::token::{RandomTokens, TokenGenerator};
use crate::trace::{debug, trace};
use crate::transaction::State;

impl From<StreamClosed> for io::Error {
    fn from(err: StreamClosed) -> Self {
        Self::new(io::ErrorKind::BrokenPipe, err)
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "write half closed")
}

/// Bidirectional stream over a channel.
///
/// Use [`ClientStream::into_split`] to read and write from different threads.
pub struct ClientStream {
    reader: ReadHalf,
    writer: WriteHalf,
}

impl ClientStream {
    /// Creates a stream over an existing channel.
    ///
    /// The channel resolves requests through [`ClientStream::responder`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is invalid.
    pub fn new<C: Channel + 'static>(channel: C, config: StreamConfig) -> Result<Self, ConfigError> {
        Self::with_tokens(channel, RandomTokens, config)
    }

    /// Like [`ClientStream::new`] with a custom token source.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is invalid.
    pub fn with_tokens<C, G>(channel: C, tokens: G, config: StreamConfig) -> Result<Self, ConfigError>
    where
        C: Channel + 'static,
        G: TokenGenerator + 'static,
    {
        config.validate()?;
        let shared = Arc::new(Shared::new(Box::new(channel), Box::new(tokens)));
        Ok(Self::from_shared(shared, &config))
    }

    /// Creates a stream whose channel is built from the stream's responder.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `config` is invalid; `make_channel` is
    /// not called in that case.
    pub fn connect<C, F>(config: StreamConfig, make_channel: F) -> Result<Self, ConfigError>
    where
        C: Channel + 'static,
        F: FnOnce(Responder) -> C,
    {
        config.validate()?;
        let shared = Shared::with_channel(Box::new(RandomTokens), make_channel);
        Ok(Self::from_shared(shared, &config))
    }

    fn from_shared(shared: Arc<Shared>, config: &StreamConfig) -> Self {
        debug!(
            write_buffer_size = config.write_buffer_size,
            read_timeout = ?config.read_timeout,
            "stream created"
        );
        Self {
            reader: ReadHalf {
                shared: Arc::clone(&shared),
                timeout: config.read_timeout,
            },
            writer: WriteHalf {
                shared,
                buffer: BytesMut::with_capacity(config.write_buffer_size),
                capacity: config.write_buffer_size,
                closed: false,
            },
        }
    }

    /// Handle for the channel to deliver completions and failures.
    #[must_use]
    pub fn responder(&self) -> Responder {
        self.reader.responder()
    }

    /// Snapshot of the stream's counters.
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        self.reader.shared.stats()
    }

    /// Sends `payload` as one request right away, bypassing the write buffer.
    ///
    /// Bytes already buffered are not sent first. The response is delivered
    /// to readers in submission order like any other.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::BrokenPipe`] if either side is closed.
    pub fn send(&self, payload: impl Into<Bytes>) -> io::Result<Submitted> {
        self.writer.send(payload)
    }

    /// State of the request `seq`, `None` once the reader has moved past it
    /// or the stream was closed.
    #[must_use]
    pub fn state_of(&self, seq: u64) -> Option<State> {
        self.reader.state_of(seq)
    }

    pub fn reader(&mut self) -> &mut ReadHalf {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut WriteHalf {
        &mut self.writer
    }

    /// Splits the stream into independently owned halves.
    #[must_use]
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        (self.reader, self.writer)
    }

    /// Closes both directions.
    ///
    /// Buffered bytes are sent first. Requests still in flight are abandoned
    /// and their late responses discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails.
    pub fn close(&mut self) -> io::Result<()> {
        let flushed = self.writer.close();
        self.reader.close();
        flushed
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Reading side of a [`ClientStream`].
pub struct ReadHalf {
    shared: Arc<Shared>,
    timeout: Timeout,
}

impl ReadHalf {
    /// Handle for the channel to deliver completions and failures.
    #[must_use]
    pub fn responder(&self) -> Responder {
        Responder::new(Arc::downgrade(&self.shared))
    }

    /// Bounds how long a single `read` may block.
    pub fn set_read_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    #[must_use]
    pub const fn read_timeout(&self) -> Timeout {
        self.timeout
    }

    /// Closes the read side; later reads return `Ok(0)`.
    ///
    /// Wakes any blocked reader, drops every tracked request and makes further
    /// writes fail. Does not wait for requests in flight. Closing twice is a
    /// no-op.
    pub fn close(&mut self) {
        self.shared.close();
    }

    /// See [`ClientStream::state_of`].
    #[must_use]
    pub fn state_of(&self, seq: u64) -> Option<State> {
        self.shared.lock().state_of(seq)
    }

    /// Handle that closes the read side from another thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Sends an empty request so the other side can answer with pending data.
    fn solicit(&self) -> Result<Submitted, StreamClosed> {
        let submitted = self.shared.submit(Bytes::new())?;
        trace!(seq = submitted.seq, "soliciting data");
        Ok(submitted)
    }
}

impl Read for ReadHalf {
    /// Reads response bytes in submission order.
    ///
    /// Blocks until the oldest outstanding request resolves. Returns `Ok(0)`
    /// only for an empty `buf` or after the read side was closed.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::TimedOut`] if the read timeout elapses first;
    /// the stream stays usable.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = self.timeout.deadline();
        let mut registry = self.shared.lock();

        loop {
            if registry.is_closed() {
                return Ok(0);
            }

            let Some((seq, state)) = registry.peek_head().map(|t| (t.seq(), t.state())) else {
                drop(registry);
                if self.solicit().is_err() {
                    // Closed while the lock was released.
                    return Ok(0);
                }
                registry = self.shared.lock();
                continue;
            };

            match state {
                State::Failed | State::Consumed => {
                    registry.pop_head();
                }
                State::NotSent | State::InFlight => {
                    registry = self
                        .shared
                        .await_resolution(registry, seq, deadline)
                        .map_err(|e| io::Error::new(io::ErrorKind::TimedOut, e))?;
                }
                State::Received => {
                    let n = registry
                        .head_mut()
                        .map_or(0, |t| t.read_into(buf));
                    if n > 0 {
                        trace!(seq, n, "read response bytes");
                        return Ok(n);
                    }
                }
            }
        }
    }
}

/// Closes a stream's read side without owning it.
///
/// A reader blocked in another thread wakes up and returns `Ok(0)`.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shared: Weak<Shared>,
}

impl ShutdownHandle {
    /// Same as [`ReadHalf::close`]. Returns false if the stream was already
    /// closed or dropped.
    pub fn shutdown(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| shared.close())
    }
}

/// Writing side of a [`ClientStream`].
///
/// Writes never block on the network: a full buffer is handed to the channel
/// and a fresh one takes its place. Unflushed bytes are dropped with the
/// half unless [`WriteHalf::close`] or `flush` is called.
pub struct WriteHalf {
    shared: Arc<Shared>,
    buffer: BytesMut,
    capacity: usize,
    closed: bool,
}

impl WriteHalf {
    /// Bytes written but not yet sent.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sends any buffered bytes and closes the write side.
    ///
    /// Later writes fail with [`io::ErrorKind::BrokenPipe`]. Closing twice is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered bytes could not be submitted because
    /// the read side is already closed.
    pub fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.send_buffer()
    }

    /// See [`ClientStream::send`].
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::BrokenPipe`] if either side is closed.
    pub fn send(&self, payload: impl Into<Bytes>) -> io::Result<Submitted> {
        if self.closed {
            return Err(broken_pipe());
        }
        let submitted = self.shared.submit(payload.into())?;
        trace!(seq = submitted.seq, "request sent directly");
        Ok(submitted)
    }

    /// Submits the buffer as one request. On failure the bytes stay buffered.
    fn send_buffer(&mut self) -> io::Result<()> {
        let fresh = BytesMut::with_capacity(self.capacity);
        let payload = mem::replace(&mut self.buffer, fresh).freeze();
        match self.shared.submit(payload.clone()) {
            Ok(submitted) => {
                trace!(seq = submitted.seq, "write buffer sent");
                Ok(())
            }
            Err(e) => {
                self.buffer.extend_from_slice(&payload);
                Err(e.into())
            }
        }
    }
}

impl Write for WriteHalf {
    /// Buffers `buf`, sending each buffer that fills up.
    ///
    /// If a send fails after part of `buf` went out, returns the count of
    /// bytes accepted so far; the bytes of the failed chunk are not kept.
    /// An error means nothing from `buf` was accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(broken_pipe());
        }

        let mut written = 0;
        while written < buf.len() {
            let take = (self.capacity - self.buffer.len()).min(buf.len() - written);
            self.buffer.extend_from_slice(&buf[written..written + take]);

            if self.buffer.len() == self.capacity
                && let Err(e) = self.send_buffer()
            {
                self.buffer.truncate(self.buffer.len() - take);
                return if written > 0 { Ok(written) } else { Err(e) };
            }
            written += take;
        }
        Ok(written)
    }

    /// Sends the buffered bytes as one request, even when the buffer is empty.
    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(broken_pipe());
        }
        self.send_buffer()
    }
}
