//! The load-balanced call wrapper.
//!
//! [`LoadBalancedClient`] runs every unary or streaming call through the
//! same loop: select a server, run the attempt under a [`ConnectionGuard`],
//! classify the failure and back off before the next attempt.

mod balanced;
mod context;
mod guard;
mod retry;
mod stream;

pub use balanced::LoadBalancedClient;
pub use context::CallContext;
pub use guard::ConnectionGuard;
pub use retry::{RetryPolicy, is_connection_error, is_retryable};
pub use stream::BalancedStream;
