// ABOUTME: Crate-level error type aggregating codec, pool, validation and config failures

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::pool::{PoolError, TransportError};
use crate::subscription::{SubscriptionState, ValidationError};

/// Errors returned by client operations.
///
/// Connection and server-side subscription failures normally surface through
/// subscription listeners instead; they appear here only from calls that
/// talk to the pool directly.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Bytes could not be decoded, or a value could not be encoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("no eligible connection within {0:?}")]
    PoolExhausted(Duration),

    #[error("connection failure: {0}")]
    ConnectionFailure(#[from] TransportError),

    #[error("invalid queries: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    /// Server rejected a request
    #[error("server error: {0}")]
    Protocol(String),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SubscriptionState,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connection pool is shut down")]
    PoolClosed,
}

impl ClientError {
    /// Decoding failed on malformed bytes.
    #[must_use]
    pub const fn is_malformed_input(&self) -> bool {
        matches!(self, Self::Codec(err) if err.is_malformed())
    }

    /// The caller may reasonably try the same call again later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted(_) | Self::ConnectionFailure(_))
    }
}

impl From<PoolError> for ClientError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted(waited) => Self::PoolExhausted(waited),
            PoolError::Closed => Self::PoolClosed,
            PoolError::Connect(err) => Self::ConnectionFailure(err),
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type ClientResult<T> = Result<T, ClientError>;
