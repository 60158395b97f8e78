//! Passive failure reporting.
//!
//! Calls that fail at the connection level (unavailable, deadline exceeded)
//! trigger an out-of-band forced probe of the server. The probe result, not
//! the failed call, decides the server's health.

use crate::registry::ServerRegistry;
use dashmap::DashSet;
use std::sync::Arc;
use tracing::debug;

/// Turns connection-level call failures into forced health probes.
#[derive(Clone)]
pub struct FailureReporter {
    registry: Arc<ServerRegistry>,
    /// Servers with a forced probe already in flight.
    pending: Arc<DashSet<String>>,
}

impl FailureReporter {
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self {
            registry,
            pending: Arc::new(DashSet::new()),
        }
    }

    /// Record a connection-level failure on `server_id`.
    ///
    /// Spawns at most one forced probe per server at a time and returns
    /// immediately. Returns false if a probe was already pending.
    pub fn connection_failed(&self, server_id: &str) -> bool {
        if !self.pending.insert(server_id.to_string()) {
            debug!(server_id = %server_id, "forced probe already pending");
            return false;
        }

        let registry = Arc::clone(&self.registry);
        let pending = Arc::clone(&self.pending);
        let id = server_id.to_string();
        tokio::spawn(async move {
            match registry.force_health_check(&id).await {
                Ok(status) => debug!(server_id = %id, %status, "probe after connection failure"),
                Err(e) => debug!(server_id = %id, error = %e, "probe after connection failure skipped"),
            }
            pending.remove(&id);
        });
        true
    }

    /// Number of forced probes currently in flight.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
