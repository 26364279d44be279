//! Boundary with the transport that carries requests and responses.
//!
//! A [`Channel`] accepts or refuses a request synchronously and resolves every
//! accepted request exactly once, later, from any thread, by calling
//! [`Responder::complete`] or [`Responder::fail`] with the request's token.
//! Resolutions for different requests may arrive in any order.

pub mod loopback;
#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::io;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use thiserror::Error;

use crate::registry::Shared;
use crate::token::Token;
use crate::trace::debug;
use crate::transaction::Failure;

/// Errors a channel reports when it cannot accept a request.
#[derive(Debug, Error)]
pub enum SendError {
    /// The transport cannot take requests right now.
    #[error("transport unavailable")]
    Unavailable,
    /// The channel has shut down.
    #[error("channel closed")]
    Closed,
    /// An I/O error occurred while handing off the request.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Transport that delivers requests and resolves them asynchronously.
pub trait Channel: Send + Sync {
    /// Hands a request to the transport without blocking on its response.
    ///
    /// The channel may resolve the request before this returns.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] if the request was not accepted; no callback
    /// will follow for it.
    fn send(&self, token: &Token, payload: Bytes) -> Result<(), SendError>;
}

impl<C: Channel + ?Sized> Channel for Arc<C> {
    fn send(&self, token: &Token, payload: Bytes) -> Result<(), SendError> {
        (**self).send(token, payload)
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn send(&self, token: &Token, payload: Bytes) -> Result<(), SendError> {
        (**self).send(token, payload)
    }
}

/// Callback handle a channel uses to resolve requests.
///
/// Cheap to clone and safe to call from any thread. It holds no strong
/// reference to the stream: once the stream is dropped, resolutions are
/// discarded.
#[derive(Clone)]
pub struct Responder {
    shared: Weak<Shared>,
}

impl Responder {
    pub(crate) const fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// Delivers the response for the request identified by `token`.
    ///
    /// Returns true if the token matched an in-flight request. Unknown tokens
    /// are logged and dropped.
    pub fn complete(&self, token: &Token, payload: impl Into<Bytes>) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.complete(token, payload.into()),
            None => {
                debug!(token = %token, "stream dropped, discarding response");
                false
            }
        }
    }

    /// Reports that the request identified by `token` will never be answered.
    ///
    /// Returns true if the token matched an in-flight request.
    pub fn fail(&self, token: &Token, why: Failure) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared.fail(token, why),
            None => {
                debug!(token = %token, reason = ?why, "stream dropped, discarding failure");
                false
            }
        }
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("attached", &(self.shared.strong_count() > 0))
            .finish()
    }
}
