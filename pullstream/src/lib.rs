//! Blocking byte streams over pull-based request/response channels.
//!
//! In a pull-based protocol every byte moves because the client asked for it,
//! and each request gets at most one response. This crate turns such a
//! [`Channel`](channel::Channel) into an ordinary [`std::io::Read`] +
//! [`std::io::Write`] stream:
//!
//! - writes are buffered and sent as request payloads,
//! - each request carries a random correlation [`Token`],
//! - responses may resolve in any order on any thread, yet the reader sees
//!   their bytes strictly in the order the requests were sent.
//!
//! Failed or timed-out requests are skipped; the bytes they would have
//! carried are lost. Retrying is left to higher layers.

pub mod channel;
pub mod config;
pub mod registry;
pub mod stream;
pub mod token;
pub mod transaction;

mod trace;

pub use channel::{Channel, Responder, SendError};
pub use config::{ConfigError, StreamConfig, Timeout};
pub use registry::{StreamClosed, StreamStats, Submitted};
pub use stream::{ClientStream, ReadHalf, ShutdownHandle, WriteHalf};
pub use token::{RandomTokens, TOKEN_LEN, Token, TokenGenerator};
pub use trace::init_tracing;
pub use transaction::{Failure, State};
