//! Lifecycle of a single request/response exchange.
//!
//! ```text
//! NotSent ──> InFlight ──> Received ──> Consumed
//!    │            │
//!    └────────────┴──────> Failed
//! ```
//!
//! States only move forward. A transaction becomes `Consumed` once the reader
//! has taken every byte of its response; `Failed` and `Consumed` are terminal.

use bytes::Bytes;
use thiserror::Error;

use crate::token::Token;

/// Position of a transaction in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Built but not yet handed to the channel.
    NotSent,
    /// Accepted by the channel, awaiting a completion or failure.
    InFlight,
    /// The channel gave up on the request (or refused it).
    Failed,
    /// Response arrived; bytes may still be unread.
    Received,
    /// Every response byte has been delivered to the reader.
    Consumed,
}

impl State {
    /// Returns true if the transaction can be dropped from the head of the queue.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Failed | Self::Consumed)
    }

    const fn can_become(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::NotSent, Self::InFlight)
                | (Self::NotSent | Self::InFlight, Self::Failed)
                | (Self::InFlight, Self::Received)
                | (Self::Received, Self::Consumed)
        )
    }
}

/// Why a transaction ended up [`State::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failure {
    /// The channel refused the request synchronously.
    Rejected,
    /// The request timed out in the transport.
    TimedOut,
    /// The transport reported an error for the request.
    Transport,
    /// The stream was closed while the request was outstanding.
    Closed,
}

/// Attempted a transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal transaction transition {from:?} -> {to:?}")]
pub(crate) struct TransitionError {
    pub(crate) from: State,
    pub(crate) to: State,
}

/// One outstanding or completed request.
#[derive(Debug)]
pub(crate) struct Transaction {
    seq: u64,
    token: Token,
    request: Bytes,
    response: Option<Bytes>,
    cursor: usize,
    state: State,
    failure: Option<Failure>,
}

impl Transaction {
    pub(crate) fn new(seq: u64, token: Token, request: Bytes) -> Self {
        Self {
            seq,
            token,
            request,
            response: None,
            cursor: 0,
            state: State::NotSent,
            failure: None,
        }
    }

    /// Submission sequence number (strictly increasing per stream).
    #[must_use]
    pub(crate) const fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub(crate) const fn token(&self) -> &Token {
        &self.token
    }

    /// Payload handed to the channel.
    #[must_use]
    pub(crate) const fn request(&self) -> &Bytes {
        &self.request
    }

    /// Response payload, once received.
    #[must_use]
    pub(crate) const fn response(&self) -> Option<&Bytes> {
        self.response.as_ref()
    }

    #[must_use]
    pub(crate) const fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub(crate) const fn failure(&self) -> Option<Failure> {
        self.failure
    }

    /// Publishes a fresh transaction as in flight.
    ///
    /// Only called by the registry right before the transaction becomes
    /// visible to channel callbacks.
    pub(crate) fn mark_sent(&mut self) {
        debug_assert_eq!(self.state, State::NotSent);
        self.state = State::InFlight;
    }

    /// Records the response for an in-flight request.
    pub(crate) fn receive(&mut self, payload: Bytes) -> Result<(), TransitionError> {
        self.transition(State::Received)?;
        self.response = Some(payload);
        Ok(())
    }

    pub(crate) fn fail(&mut self, why: Failure) -> Result<(), TransitionError> {
        self.transition(State::Failed)?;
        self.failure = Some(why);
        Ok(())
    }

    /// Copies unread response bytes into `buf`, returning how many were copied.
    ///
    /// Moves to [`State::Consumed`] when the cursor reaches the end of the
    /// response, including for an empty response. Returns 0 in any state
    /// other than [`State::Received`].
    pub(crate) fn read_into(&mut self, buf: &mut [u8]) -> usize {
        if self.state != State::Received {
            return 0;
        }
        let Some(response) = self.response.as_ref() else {
            return 0;
        };

        let n = buf.len().min(response.len() - self.cursor);
        buf[..n].copy_from_slice(&response[self.cursor..self.cursor + n]);
        self.cursor += n;

        if self.cursor == response.len() {
            self.state = State::Consumed;
        }
        n
    }

    fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if !self.state.can_become(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}
