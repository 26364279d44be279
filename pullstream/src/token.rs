//! Correlation tokens that tie an asynchronous response to its request.

use std::fmt;

use thiserror::Error;

/// Size of a correlation token in bytes.
pub const TOKEN_LEN: usize = 32;

/// Opaque per-request correlation token.
///
/// Invariant: unique among the transactions a stream is tracking. Tokens are
/// drawn from a cryptographically strong source, so a collision is treated as
/// a bug rather than something to recover from.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    /// Generates a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Wraps raw token bytes, e.g. after decoding them from the wire.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes for wire serialization.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Error when building a [`Token`] from a slice of the wrong size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("token must be 32 bytes, got {0}")]
pub struct TokenLengthError(pub usize);

impl TryFrom<&[u8]> for Token {
    type Error = TokenLengthError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        <[u8; TOKEN_LEN]>::try_from(bytes)
            .map(Self)
            .map_err(|_| TokenLengthError(bytes.len()))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes are plenty to tell tokens apart in logs.
        write!(f, "Token(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Source of correlation tokens for a stream.
pub trait TokenGenerator: Send + Sync {
    /// Produces the token for the next request.
    fn generate(&self) -> Token;
}

/// Default generator backed by the thread-local CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomTokens;

impl TokenGenerator for RandomTokens {
    fn generate(&self) -> Token {
        Token::generate()
    }
}
