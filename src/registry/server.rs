//! Backend server records owned by the registry.

use crate::transport::Connection;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Liveness of a server as last reported by the health checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight call counter of one server instance.
///
/// Shared with every [`SelectedServer`] handed out for that instance, so a
/// call always settles against the server it started on, even after the id
/// has been removed and registered again.
#[derive(Debug, Clone, Default)]
pub(crate) struct ConnectionCount(Arc<AtomicU64>);

impl ConnectionCount {
    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement, clamping at zero. Returns the new count.
    pub(crate) fn decrement(&self) -> u64 {
        let previous = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    /// True if both handles count for the same server instance.
    pub(crate) fn same_instance(&self, other: &ConnectionCount) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// One backend endpoint.
///
/// Identity, target and weight never change after creation. The in-flight
/// counter is atomic so it can move under the registry's read lock; health
/// only changes under the write lock. `generation` tells apart servers
/// registered under the same id at different times.
pub struct Server {
    id: String,
    generation: u64,
    address: String,
    port: u16,
    weight: u32,
    connections: ConnectionCount,
    health: HealthStatus,
    last_health_change: Instant,
    connection: Arc<dyn Connection>,
}

impl Server {
    pub(crate) fn new(
        id: String,
        generation: u64,
        address: String,
        port: u16,
        weight: u32,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            id,
            generation,
            address,
            port,
            weight,
            connections: ConnectionCount::default(),
            health: HealthStatus::Unknown,
            last_health_change: Instant::now(),
            connection,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Calls currently in flight on this server.
    pub fn connections(&self) -> u64 {
        self.connections.get()
    }

    pub fn health(&self) -> HealthStatus {
        self.health
    }

    pub fn is_healthy(&self) -> bool {
        self.health == HealthStatus::Healthy
    }

    pub fn last_health_change(&self) -> Instant {
        self.last_health_change
    }

    pub(crate) fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn connection_count(&self) -> &ConnectionCount {
        &self.connections
    }

    pub(crate) fn increment_connections(&self) -> u64 {
        self.connections.increment()
    }

    /// Decrement, clamping at zero. Returns the new count.
    pub(crate) fn decrement_connections(&self) -> u64 {
        self.connections.decrement()
    }

    /// Apply a health report. Returns true if the status changed.
    pub(crate) fn set_health(&mut self, status: HealthStatus) -> bool {
        if self.health == status {
            return false;
        }
        self.health = status;
        self.last_health_change = Instant::now();
        true
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("weight", &self.weight)
            .field("connections", &self.connections())
            .field("health", &self.health)
            .finish_non_exhaustive()
    }
}

/// A server chosen by [`ServerRegistry::select`](crate::registry::ServerRegistry::select).
///
/// Carries a clone of the server's connection handle so the call can run
/// without holding any registry lock.
#[derive(Clone)]
pub struct SelectedServer {
    id: String,
    address: String,
    port: u16,
    connection: Arc<dyn Connection>,
    connections: ConnectionCount,
}

impl SelectedServer {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub(crate) fn connection_count(&self) -> &ConnectionCount {
        &self.connections
    }
}

impl From<&Server> for SelectedServer {
    fn from(server: &Server) -> Self {
        Self {
            id: server.id.clone(),
            address: server.address.clone(),
            port: server.port,
            connection: Arc::clone(&server.connection),
            connections: server.connections.clone(),
        }
    }
}

impl fmt::Debug for SelectedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedServer")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}
