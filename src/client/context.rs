//! Per-call options.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options a caller attaches to one balanced call.
///
/// A non-empty session id opts the call into sticky routing when the
/// registry has sticky sessions enabled. Cancelling the token aborts the
/// current attempt or backoff and fails the call with
/// [`LbError::Cancelled`](crate::error::LbError::Cancelled).
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    session_id: Option<String>,
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bound every single attempt. An attempt that runs out of time counts
    /// as a retryable `DeadlineExceeded` failure.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Session key, if one was given and it is not empty.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref().filter(|s| !s.is_empty())
    }

    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Resolves once the call is cancelled. Never resolves without a token.
    pub(crate) async fn cancelled(&self) {
        match &self.cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    }
}
