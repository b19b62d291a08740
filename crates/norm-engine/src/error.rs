//! # Error Types
//!
//! A narrow, matchable error enum for everything the embedder can act on.
//! Wire-format and resource-exhaustion errors never panic and never unwind
//! past a session method boundary — see `SPEC_FULL.md` §7.

use std::fmt;

/// Crate-level error type.
#[derive(Debug)]
pub enum NormError {
    /// Invalid configuration (rate, FEC parameters, segment size out of bounds).
    Config(String),
    /// Truncated or malformed wire message, unknown FEC id, unknown CMD flavor.
    Codec(String),
    /// FEC encode/decode failure (singular submatrix, bad erasure pattern).
    Fec(String),
    /// A fixed-capacity pool had no free entries and stealing could not help.
    PoolExhausted,
    /// Underlying I/O failure from a storage backing.
    Io(std::io::Error),
}

impl fmt::Display for NormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NormError::Config(msg) => write!(f, "config error: {msg}"),
            NormError::Codec(msg) => write!(f, "wire codec error: {msg}"),
            NormError::Fec(msg) => write!(f, "fec error: {msg}"),
            NormError::PoolExhausted => write!(f, "pool exhausted"),
            NormError::Io(e) => write!(f, "i/o error: {e}"),
        }
    }
}

impl std::error::Error for NormError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NormError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NormError {
    fn from(e: std::io::Error) -> Self {
        NormError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, NormError>;
