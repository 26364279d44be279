//! Transaction registry shared by the reader, the writer and channel callbacks.
//!
//! # Design
//!
//! - Transactions live in a queue ordered by submission; the queue is only
//!   ever drained from the head.
//! - A token index maps each token to its submission sequence number. Since
//!   sequence numbers in the queue are contiguous, `seq - head_seq` is the
//!   queue position, which keeps callback lookups O(1).
//! - One mutex guards queue, index and the closed flag. The condition
//!   variable waited on by readers pairs with that same mutex, so a reader
//!   re-checks its transaction under the lock the callback mutated it under
//!   and cannot miss a wakeup.
//! - Callbacks broadcast on every state change; each waiter re-checks its own
//!   transaction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use minstant::Instant;
use thiserror::Error;

use crate::channel::{Channel, Responder};
use crate::token::{Token, TokenGenerator};
use crate::trace::{debug, info, trace, warn};
use crate::transaction::{Failure, State, Transaction};

/// Handle to a submitted request, returned by [`ClientStream::send`](crate::ClientStream::send).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    /// Submission sequence number.
    pub seq: u64,
    /// Correlation token handed to the channel.
    pub token: Token,
}

/// Counters describing what a stream has done so far.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    /// Requests handed to the channel (including rejected ones).
    pub submitted: u64,
    /// Requests that received a response.
    pub received: u64,
    /// Requests that failed: rejected, timed out, transport error or closed.
    pub failed: u64,
    /// Requests the channel refused synchronously.
    pub rejected: u64,
    /// Callbacks whose token matched no in-flight transaction.
    pub unmatched: u64,
    /// Responses fully delivered to the reader.
    pub consumed: u64,
    /// Transactions currently queued.
    pub pending: usize,
}

/// The stream's read side has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stream closed")]
pub struct StreamClosed;

/// A wait gave up before its transaction was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out waiting for response")]
pub(crate) struct WaitTimedOut;

/// Ordered queue of transactions plus the token index.
///
/// # Invariants
///
/// - `queue[i].seq() == head_seq + i`
/// - `head_seq == next_seq` whenever the queue is empty
/// - every index entry points at a queued transaction carrying that token
#[derive(Debug)]
pub(crate) struct Registry {
    queue: VecDeque<Transaction>,
    index: HashMap<Token, u64>,
    head_seq: u64,
    next_seq: u64,
    closed: bool,
    stats: StreamStats,
}

impl Registry {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            index: HashMap::new(),
            head_seq: 0,
            next_seq: 0,
            closed: false,
            stats: StreamStats::default(),
        }
    }

    /// Appends a new transaction and publishes it as in flight.
    fn push(&mut self, token: Token, request: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut transaction = Transaction::new(seq, token, request);
        transaction.mark_sent();
        self.queue.push_back(transaction);

        if let Some(previous) = self.index.insert(token, seq) {
            warn!(token = %token, previous, seq, "token collision, index entry overwritten");
        }
        self.stats.submitted += 1;
        seq
    }

    /// Oldest transaction in submission order.
    pub(crate) fn peek_head(&self) -> Option<&Transaction> {
        self.queue.front()
    }

    pub(crate) fn head_mut(&mut self) -> Option<&mut Transaction> {
        self.queue.front_mut()
    }

    /// Removes the oldest transaction if it is failed or consumed.
    pub(crate) fn pop_head(&mut self) -> Option<Transaction> {
        if !self.queue.front()?.state().is_finished() {
            return None;
        }
        let transaction = self.queue.pop_front()?;
        self.head_seq += 1;

        if self.index.get(transaction.token()) == Some(&transaction.seq()) {
            self.index.remove(transaction.token());
        }
        if transaction.state() == State::Consumed {
            self.stats.consumed += 1;
        }
        trace!(
            seq = transaction.seq(),
            sent = transaction.request().len(),
            received = transaction.response().map_or(0, Bytes::len),
            failure = ?transaction.failure(),
            "transaction retired"
        );
        Some(transaction)
    }

    /// Looks up the transaction a callback refers to.
    pub(crate) fn resolve(&mut self, token: &Token) -> Option<&mut Transaction> {
        let seq = *self.index.get(token)?;
        let transaction = self.get_mut(seq)?;
        (transaction.token() == token).then_some(transaction)
    }

    fn get_mut(&mut self, seq: u64) -> Option<&mut Transaction> {
        let pos = usize::try_from(seq.checked_sub(self.head_seq)?).ok()?;
        self.queue.get_mut(pos)
    }

    /// State of a queued transaction, `None` once it has been popped.
    pub(crate) fn state_of(&self, seq: u64) -> Option<State> {
        let pos = usize::try_from(seq.checked_sub(self.head_seq)?).ok()?;
        self.queue.get(pos).map(Transaction::state)
    }

    /// Returns true while a reader waiting on `seq` should keep sleeping.
    fn awaiting(&self, seq: u64) -> bool {
        !self.closed && self.state_of(seq) == Some(State::InFlight)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Fails everything still outstanding and forgets every transaction.
    fn drain(&mut self) -> usize {
        let mut abandoned = 0;
        for transaction in &mut self.queue {
            if transaction.fail(Failure::Closed).is_ok() {
                abandoned += 1;
            }
        }
        self.stats.failed += abandoned;

        self.queue.clear();
        self.index.clear();
        self.head_seq = self.next_seq;
        abandoned as usize
    }
}

/// State shared between the stream halves and the channel's [`Responder`]s.
pub(crate) struct Shared {
    registry: Mutex<Registry>,
    resolved: Condvar,
    channel: Box<dyn Channel>,
    tokens: Box<dyn TokenGenerator>,
}

impl Shared {
    pub(crate) fn new(channel: Box<dyn Channel>, tokens: Box<dyn TokenGenerator>) -> Self {
        Self {
            registry: Mutex::new(Registry::new()),
            resolved: Condvar::new(),
            channel,
            tokens,
        }
    }

    /// Builds shared state whose channel is created from its own responder.
    pub(crate) fn with_channel<C, F>(tokens: Box<dyn TokenGenerator>, make_channel: F) -> Arc<Self>
    where
        C: Channel + 'static,
        F: FnOnce(Responder) -> C,
    {
        Arc::new_cyclic(|weak| {
            let channel = make_channel(Responder::new(weak.clone()));
            Self::new(Box::new(channel), tokens)
        })
    }

    /// Locks the registry.
    ///
    /// A callback thread that panicked while holding the lock leaves the
    /// registry consistent (every mutation is a single assignment), so the
    /// poison flag is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a request and hands it to the channel.
    ///
    /// The transaction is published before `Channel::send` runs and the lock
    /// is released during the send, so a channel may resolve the request from
    /// inside `send`. A synchronous rejection fails the transaction and is
    /// not reported as an error.
    ///
    /// # Errors
    ///
    /// Returns [`StreamClosed`] if the read side has been closed.
    pub(crate) fn submit(&self, request: Bytes) -> Result<Submitted, StreamClosed> {
        let token = self.tokens.generate();
        let len = request.len();

        let seq = {
            let mut registry = self.lock();
            if registry.closed {
                return Err(StreamClosed);
            }
            registry.push(token, request.clone())
        };
        trace!(token = %token, seq, len, "request submitted");

        if let Err(e) = self.channel.send(&token, request) {
            warn!(token = %token, seq, error = %e, "channel rejected request");
            let mut registry = self.lock();
            registry.stats.rejected += 1;
            let failed = registry
                .get_mut(seq)
                .is_some_and(|t| t.fail(Failure::Rejected).is_ok());
            if failed {
                registry.stats.failed += 1;
            }
            drop(registry);
            self.notify_resolved();
        }

        Ok(Submitted { seq, token })
    }

    /// Completion callback: stores the response for `token`.
    ///
    /// Returns true if the token matched an in-flight transaction.
    pub(crate) fn complete(&self, token: &Token, payload: Bytes) -> bool {
        let len = payload.len();
        let mut registry = self.lock();
        let outcome = registry
            .resolve(token)
            .map(|t| (t.seq(), t.receive(payload)));

        let matched = match outcome {
            Some((seq, Ok(()))) => {
                registry.stats.received += 1;
                trace!(token = %token, seq, len, "response received");
                true
            }
            Some((seq, Err(e))) => {
                registry.stats.unmatched += 1;
                warn!(token = %token, seq, error = %e, "discarding response for resolved request");
                false
            }
            None => {
                registry.stats.unmatched += 1;
                warn!(token = %token, len, "discarding response with unmatched token");
                false
            }
        };
        drop(registry);

        self.notify_resolved();
        matched
    }

    /// Failure callback: marks the transaction for `token` as failed.
    ///
    /// Returns true if the token matched an in-flight transaction.
    pub(crate) fn fail(&self, token: &Token, why: Failure) -> bool {
        let mut registry = self.lock();
        let outcome = registry.resolve(token).map(|t| (t.seq(), t.fail(why)));

        let matched = match outcome {
            Some((seq, Ok(()))) => {
                registry.stats.failed += 1;
                warn!(token = %token, seq, reason = ?why, "request failed");
                true
            }
            Some((seq, Err(e))) => {
                registry.stats.unmatched += 1;
                warn!(token = %token, seq, error = %e, "discarding failure for resolved request");
                false
            }
            None => {
                registry.stats.unmatched += 1;
                warn!(token = %token, reason = ?why, "discarding failure with unmatched token");
                false
            }
        };
        drop(registry);

        self.notify_resolved();
        matched
    }

    /// Blocks until transaction `seq` leaves the in-flight state.
    ///
    /// Also returns when the transaction is no longer queued or the stream is
    /// closed. Spurious wakeups are absorbed by re-checking under the lock.
    ///
    /// # Errors
    ///
    /// Returns [`WaitTimedOut`] if `deadline` passes first.
    pub(crate) fn await_resolution<'a>(
        &'a self,
        guard: MutexGuard<'a, Registry>,
        seq: u64,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, Registry>, WaitTimedOut> {
        let Some(deadline) = deadline else {
            return Ok(self
                .resolved
                .wait_while(guard, |registry| registry.awaiting(seq))
                .unwrap_or_else(PoisonError::into_inner));
        };

        let mut guard = guard;
        loop {
            if !guard.awaiting(seq) {
                return Ok(guard);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                debug!(seq, "wait for response timed out");
                return Err(WaitTimedOut);
            };
            guard = self
                .resolved
                .wait_timeout(guard, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wakes every waiting reader.
    pub(crate) fn notify_resolved(&self) {
        self.resolved.notify_all();
    }

    /// Closes the read side: fails outstanding requests and drops all state.
    ///
    /// Callbacks that arrive afterwards find no matching token and are
    /// discarded. Returns false if already closed.
    pub(crate) fn close(&self) -> bool {
        let mut registry = self.lock();
        if registry.closed {
            return false;
        }
        registry.closed = true;
        let abandoned = registry.drain();
        drop(registry);

        info!(abandoned, "stream read side closed");
        self.notify_resolved();
        true
    }

    pub(crate) fn stats(&self) -> StreamStats {
        let registry = self.lock();
        StreamStats {
            pending: registry.len(),
            ..registry.stats
        }
    }
}
