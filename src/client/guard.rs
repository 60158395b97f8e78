//! Scoped in-flight call accounting.

use crate::registry::{ConnectionCount, SelectedServer, ServerRegistry};
use std::sync::Arc;

/// Counts one call in flight on a server for as long as it is alive.
///
/// Acquiring increments the selected server's connection counter, dropping
/// decrements the same counter. A server removed and registered again under
/// the same id in between is a different instance and is left alone.
pub struct ConnectionGuard {
    registry: Arc<ServerRegistry>,
    server_id: String,
    count: ConnectionCount,
}

impl ConnectionGuard {
    pub fn acquire(registry: Arc<ServerRegistry>, server: &SelectedServer) -> Self {
        let count = server.connection_count().clone();
        registry.call_started(server.id(), &count);
        Self {
            registry,
            server_id: server.id().to_string(),
            count,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.call_finished(&self.server_id, &self.count);
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("server_id", &self.server_id)
            .finish()
    }
}
