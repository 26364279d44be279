//! Recording channel for unit tests.

use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{Channel, SendError};
use crate::token::Token;

#[derive(Default)]
struct MockState {
    sent: Vec<(Token, Bytes)>,
    rejected: usize,
    reject: bool,
}

/// Records every accepted request and never resolves anything on its own.
#[derive(Clone, Default)]
pub(crate) struct MockChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    /// Requests accepted so far, in send order.
    pub(crate) fn sent(&self) -> Vec<(Token, Bytes)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub(crate) fn sent_count(&self) -> usize {
        self.state.lock().unwrap().sent.len()
    }

    pub(crate) fn rejected_count(&self) -> usize {
        self.state.lock().unwrap().rejected
    }

    /// Makes subsequent sends fail with [`SendError::Unavailable`].
    pub(crate) fn reject_sends(&self, reject: bool) {
        self.state.lock().unwrap().reject = reject;
    }
}

impl Channel for MockChannel {
    fn send(&self, token: &Token, payload: Bytes) -> Result<(), SendError> {
        let mut state = self.state.lock().unwrap();
        if state.reject {
            state.rejected += 1;
            return Err(SendError::Unavailable);
        }
        state.sent.push((*token, payload));
        Ok(())
    }
}
