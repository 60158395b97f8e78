//! Error taxonomy of the balancer.

use crate::transport::{Code, Status};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the registry and the load-balanced client.
#[derive(Debug, Error)]
pub enum LbError {
    #[error("server {0} not found")]
    NotFound(String),

    #[error("server {0} already exists")]
    AlreadyExists(String),

    #[error("no healthy servers available")]
    Unavailable,

    /// Every attempt failed with a retryable error. `last` is the final one.
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Status,
    },

    #[error("call cancelled")]
    Cancelled,

    #[error("failover timeout of {0:?} elapsed")]
    FailoverTimeout(Duration),

    #[error("failed to connect to server {id}: {source}")]
    Connect { id: String, source: Status },

    /// A non-retryable failure reported by the backend, passed through as is.
    #[error(transparent)]
    Rpc(#[from] Status),
}

impl LbError {
    /// Status code this error maps to.
    pub fn code(&self) -> Code {
        match self {
            LbError::NotFound(_) => Code::NotFound,
            LbError::AlreadyExists(_) => Code::AlreadyExists,
            LbError::Unavailable => Code::Unavailable,
            LbError::RetriesExhausted { .. } | LbError::FailoverTimeout(_) => {
                Code::DeadlineExceeded
            }
            LbError::Cancelled => Code::Cancelled,
            LbError::Connect { source, .. } => source.code(),
            LbError::Rpc(status) => status.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LbError>;
