//! Library error type.
//!
//! The protocol layer and the client need callers to `match` on *why* a
//! request failed (spec error kinds: timeout, activation, protocol,
//! argument, connection state, exhausted activation codes) rather than
//! downcast an opaque `anyhow::Error`. The CLI binary still uses `anyhow`
//! for its own glue, converting these via `?` (`Error` implements
//! `std::error::Error`, so `anyhow::Error: From<Error>` comes for free).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("timed out waiting for a response after {0:?}")]
    Timeout(std::time::Duration),

    #[error("activation failed: {reason}")]
    Activation { reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not connected: {0}")]
    NotConnected(&'static str),

    #[error("no activation code matched after trying {tried} candidate(s)")]
    NoMatchingCode { tried: usize },

    #[error("BLE transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn activation<S: Into<String>>(reason: S) -> Self {
        Error::Activation {
            reason: reason.into(),
        }
    }
}
