//! Server registry, sticky sessions and selection strategies.

pub mod algorithms;
mod pool;
mod server;
mod session;

pub use pool::{HealthSummary, PoolHealth, RegistryStats, ServerRegistry, ServerStats};
pub use server::{HealthStatus, SelectedServer, Server};
pub(crate) use server::ConnectionCount;
pub use session::Session;
