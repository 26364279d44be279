//! In-process channel that answers requests from a worker thread.
//!
//! The worker hands each request payload to a handler and resolves the
//! request once the handler's chosen delay has passed. Requests with shorter
//! delays resolve first, so a handler that varies its delays exercises
//! out-of-order completion.
//!
//! ```ignore
//! let stream = ClientStream::connect(StreamConfig::default(), |responder| {
//!     LoopbackChannel::spawn(responder, |payload| Reply::data(payload.clone()))
//! })?;
//! ```

use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use minstant::Instant;

use super::{Channel, Responder, SendError};
use crate::token::Token;
use crate::trace::{debug, trace};
use crate::transaction::Failure;

/// How the loopback worker resolves one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Complete the request with this response payload.
    Data(Bytes),
    /// Fail the request.
    Fail(Failure),
}

/// A handler's answer to a request, optionally delayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    outcome: Outcome,
    delay: Duration,
}

impl Reply {
    /// Completes the request with `payload`.
    #[must_use]
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self {
            outcome: Outcome::Data(payload.into()),
            delay: Duration::ZERO,
        }
    }

    /// Fails the request with `why`.
    #[must_use]
    pub const fn fail(why: Failure) -> Self {
        Self {
            outcome: Outcome::Fail(why),
            delay: Duration::ZERO,
        }
    }

    /// Holds the resolution back for `delay`.
    #[must_use]
    pub const fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Resolution waiting for its due time.
struct Pending {
    due: Instant,
    order: u64,
    token: Token,
    outcome: Outcome,
}

/// Channel backed by a local worker thread.
///
/// Dropping the channel stops the worker; resolutions still pending are
/// discarded.
pub struct LoopbackChannel {
    requests: Option<Sender<(Token, Bytes)>>,
    worker: Option<JoinHandle<()>>,
}

impl LoopbackChannel {
    /// Spawns the worker thread.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn<H>(responder: Responder, handler: H) -> Self
    where
        H: FnMut(&Bytes) -> Reply + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name("pullstream-loopback".into())
            .spawn(move || {
                debug!("loopback worker started");
                run(&rx, &responder, handler);
                debug!("loopback worker exiting");
            })
            .expect("failed to spawn loopback thread");

        Self {
            requests: Some(tx),
            worker: Some(worker),
        }
    }

    /// Channel that answers every request with its own payload.
    #[must_use]
    pub fn echo(responder: Responder) -> Self {
        Self::spawn(responder, |payload| Reply::data(payload.clone()))
    }
}

impl Channel for LoopbackChannel {
    fn send(&self, token: &Token, payload: Bytes) -> Result<(), SendError> {
        let Some(requests) = &self.requests else {
            return Err(SendError::Closed);
        };
        requests
            .send((*token, payload))
            .map_err(|_| SendError::Closed)
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        // Disconnecting the queue tells the worker to exit.
        self.requests.take();

        // The last stream reference can be released on the worker itself.
        if let Some(handle) = self.worker.take()
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

fn run<H>(requests: &Receiver<(Token, Bytes)>, responder: &Responder, mut handler: H)
where
    H: FnMut(&Bytes) -> Reply,
{
    let mut pending: Vec<Pending> = Vec::new();
    let mut order = 0u64;

    loop {
        pending.sort_by_key(|p| (p.due, p.order));
        let now = Instant::now();
        let ready = pending.partition_point(|p| p.due <= now);
        for p in pending.drain(..ready) {
            match p.outcome {
                Outcome::Data(payload) => {
                    trace!(token = %p.token, len = payload.len(), "loopback completing request");
                    responder.complete(&p.token, payload);
                }
                Outcome::Fail(why) => {
                    trace!(token = %p.token, reason = ?why, "loopback failing request");
                    responder.fail(&p.token, why);
                }
            }
        }

        let received = match pending.first() {
            None => requests.recv().map_err(|_| RecvTimeoutError::Disconnected),
            Some(next) => {
                let wait = next
                    .due
                    .checked_duration_since(Instant::now())
                    .unwrap_or_default();
                requests.recv_timeout(wait)
            }
        };

        match received {
            Ok((token, payload)) => {
                let reply = handler(&payload);
                pending.push(Pending {
                    due: Instant::now() + reply.delay,
                    order,
                    token,
                    outcome: reply.outcome,
                });
                order += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
