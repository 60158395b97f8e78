//! The server registry.
//!
//! Owns the server list and the sticky-session table behind a single
//! reader/writer lock and starts one health monitor per server.

use crate::config::{Algorithm, BalancerConfig};
use crate::error::{LbError, Result};
use crate::health::{HealthChecker, HealthReporter, ProbeSettings};
use crate::metrics::MetricsCollector;
use crate::registry::algorithms::{self, Candidate, SelectionStrategy};
use crate::registry::server::{ConnectionCount, HealthStatus, SelectedServer, Server};
use crate::registry::session::{Session, SessionTable};
use crate::transport::Connector;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct RegistryState {
    servers: Vec<Server>,
    sessions: SessionTable,
}

/// Registry of backend servers with pluggable selection.
pub struct ServerRegistry {
    state: RwLock<RegistryState>,
    strategy: Box<dyn SelectionStrategy>,
    algorithm: Algorithm,
    sticky_session: bool,
    connector: Arc<dyn Connector>,
    checker: HealthChecker,
    metrics: MetricsCollector,
    generations: AtomicU64,
}

impl ServerRegistry {
    /// Create a registry with its own metrics collector.
    pub fn new(config: &BalancerConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::with_metrics(config, connector, MetricsCollector::new())
    }

    /// Create a registry reporting into `metrics`.
    pub fn with_metrics(
        config: &BalancerConfig,
        connector: Arc<dyn Connector>,
        metrics: MetricsCollector,
    ) -> Arc<Self> {
        Arc::new_cyclic(|registry: &Weak<Self>| {
            let registry = registry.clone();
            let reporter: HealthReporter =
                Arc::new(move |id: &str, generation: u64, status: HealthStatus| {
                    if let Some(registry) = registry.upgrade() {
                        registry.report_health(id, generation, status);
                    }
                });

            let settings = ProbeSettings {
                interval: config.health_check_interval,
                timeout: config.health_check_timeout,
            };

            Self {
                state: RwLock::new(RegistryState {
                    servers: Vec::new(),
                    sessions: SessionTable::new(config.session_timeout),
                }),
                strategy: algorithms::build(config.strategy),
                algorithm: config.strategy,
                sticky_session: config.sticky_session,
                connector,
                checker: HealthChecker::new(settings, reporter, metrics.clone()),
                metrics,
                generations: AtomicU64::new(0),
            }
        })
    }

    /// Register a server, connect to it and start monitoring its health.
    ///
    /// The server starts out `Unknown` and is not selectable until its first
    /// probe reports it healthy.
    pub async fn add_server(
        &self,
        id: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        weight: u32,
    ) -> Result<()> {
        let id = id.into();
        let address = address.into();

        if self.contains(&id) {
            return Err(LbError::AlreadyExists(id));
        }

        let connection = self
            .connector
            .connect(&address, port)
            .await
            .map_err(|source| LbError::Connect {
                id: id.clone(),
                source,
            })?;

        let inserted = {
            let mut state = self.state.write();
            if state.servers.iter().any(|s| s.id() == id) {
                false
            } else {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                state.servers.push(Server::new(
                    id.clone(),
                    generation,
                    address.clone(),
                    port,
                    weight,
                    Arc::clone(&connection),
                ));
                // Started under the lock so a concurrent removal always finds the monitor.
                self.checker.start(&id, generation, Arc::clone(&connection));
                true
            }
        };

        if !inserted {
            connection.close().await;
            return Err(LbError::AlreadyExists(id));
        }

        self.metrics.set_server_connections(&id, 0);
        info!(server_id = %id, address = %address, port, weight, "added server");
        Ok(())
    }

    /// Remove a server.
    ///
    /// Its health monitor is detached together with the server, so the id
    /// can be registered again right away. The monitor (including any forced
    /// check it is running) is awaited before the connection is closed, and
    /// every session bound to the server is dropped.
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let (server, sessions, monitor) = {
            let mut state = self.state.write();
            let pos = state
                .servers
                .iter()
                .position(|s| s.id() == id)
                .ok_or_else(|| LbError::NotFound(id.to_string()))?;
            let server = state.servers.remove(pos);
            let sessions = state.sessions.remove_server(id);
            (server, sessions, self.checker.detach(id))
        };

        if let Some(monitor) = monitor {
            monitor.join(id).await;
        }
        server.connection().close().await;
        self.metrics.remove_server(id);

        info!(server_id = %id, dropped_sessions = sessions, "removed server");
        Ok(())
    }

    /// Pick a healthy server for a call.
    ///
    /// With sticky sessions enabled and a non-empty `session_id`, a live
    /// binding to a healthy server wins; otherwise the strategy picks among
    /// healthy servers and the session is (re)bound to the result.
    pub fn select(&self, session_id: Option<&str>) -> Result<SelectedServer> {
        let session_id = session_id.filter(|s| self.sticky_session && !s.is_empty());

        let selected = match session_id {
            Some(session_id) => {
                let mut state = self.state.write();
                self.select_sticky(&mut state, session_id, Instant::now())
            }
            None => {
                let state = self.state.read();
                self.select_healthy(&state.servers)
            }
        }?;

        self.metrics.record_selection(selected.id());
        Ok(selected)
    }

    fn select_sticky(
        &self,
        state: &mut RegistryState,
        session_id: &str,
        now: Instant,
    ) -> Result<SelectedServer> {
        if let Some(server_id) = state.sessions.lookup(session_id, now).map(str::to_owned) {
            let bound = state
                .servers
                .iter()
                .find(|s| s.id() == server_id && s.is_healthy())
                .map(SelectedServer::from);

            match bound {
                Some(server) => {
                    state.sessions.touch(session_id, now);
                    debug!(session_id, server_id = %server.id(), "reusing sticky session");
                    return Ok(server);
                }
                None => {
                    debug!(session_id, server_id = %server_id, "sticky server gone or unhealthy");
                    state.sessions.remove(session_id);
                }
            }
        }

        let server = self.select_healthy(&state.servers)?;
        state.sessions.bind(session_id, server.id(), now);
        Ok(server)
    }

    fn select_healthy(&self, servers: &[Server]) -> Result<SelectedServer> {
        let healthy: Vec<&Server> = servers.iter().filter(|s| s.is_healthy()).collect();
        if healthy.is_empty() {
            warn!(total = servers.len(), "no healthy servers available");
            return Err(LbError::Unavailable);
        }

        let candidates: Vec<Candidate> = healthy
            .iter()
            .map(|s| Candidate {
                weight: s.weight(),
                connections: s.connections(),
            })
            .collect();

        let idx = self
            .strategy
            .select(&candidates)
            .ok_or(LbError::Unavailable)?;
        let server = healthy[idx];

        debug!(server_id = %server.id(), strategy = %self.algorithm, "selected server");
        Ok(SelectedServer::from(server))
    }

    /// Count a call starting on `id`. No-op for unknown servers.
    pub fn increment_connections(&self, id: &str) {
        let state = self.state.read();
        if let Some(server) = state.servers.iter().find(|s| s.id() == id) {
            let count = server.increment_connections();
            self.metrics.set_server_connections(id, count);
        }
    }

    /// Count a call finishing on `id`, clamping at zero. No-op for unknown servers.
    pub fn decrement_connections(&self, id: &str) {
        let state = self.state.read();
        if let Some(server) = state.servers.iter().find(|s| s.id() == id) {
            let count = server.decrement_connections();
            self.metrics.set_server_connections(id, count);
        }
    }

    /// Count a call starting on the server instance owning `count`.
    pub(crate) fn call_started(&self, id: &str, count: &ConnectionCount) {
        let state = self.state.read();
        let value = count.increment();
        self.publish_connections(&state.servers, id, count, value);
    }

    /// Count a call finishing on the server instance owning `count`.
    ///
    /// Settles against that instance even if `id` now names another one.
    pub(crate) fn call_finished(&self, id: &str, count: &ConnectionCount) {
        let state = self.state.read();
        let value = count.decrement();
        self.publish_connections(&state.servers, id, count, value);
    }

    fn publish_connections(
        &self,
        servers: &[Server],
        id: &str,
        count: &ConnectionCount,
        value: u64,
    ) {
        let current = servers
            .iter()
            .any(|s| s.id() == id && s.connection_count().same_instance(count));
        if current {
            self.metrics.set_server_connections(id, value);
        }
    }

    /// Calls in flight on `id`.
    pub fn connections(&self, id: &str) -> Option<u64> {
        let state = self.state.read();
        state
            .servers
            .iter()
            .find(|s| s.id() == id)
            .map(Server::connections)
    }

    /// Set the health of `id`.
    ///
    /// Only an actual transition moves the server's last-change timestamp.
    pub fn update_health(&self, id: &str, status: HealthStatus) {
        self.apply_health(id, None, status);
    }

    /// Health report from the monitor of generation `generation` of `id`.
    ///
    /// Ignored unless that generation is still the registered one.
    pub(crate) fn report_health(&self, id: &str, generation: u64, status: HealthStatus) {
        self.apply_health(id, Some(generation), status);
    }

    fn apply_health(&self, id: &str, generation: Option<u64>, status: HealthStatus) {
        let mut state = self.state.write();
        let Some(server) = state
            .servers
            .iter_mut()
            .find(|s| s.id() == id && generation.is_none_or(|g| s.generation() == g))
        else {
            debug!(
                server_id = %id,
                ?generation,
                %status,
                "health report for unknown server ignored"
            );
            return;
        };

        let previous = server.health();
        if !server.set_health(status) {
            return;
        }

        self.metrics.set_server_health(id, status);
        match status {
            HealthStatus::Healthy => {
                info!(server_id = %id, from = %previous, "server marked healthy")
            }
            _ => warn!(server_id = %id, from = %previous, to = %status, "server health changed"),
        }
    }

    /// Current health of `id`.
    pub fn health(&self, id: &str) -> Option<HealthStatus> {
        let state = self.state.read();
        state
            .servers
            .iter()
            .find(|s| s.id() == id)
            .map(Server::health)
    }

    /// Live sticky binding for `session_id`, if any.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        let now = Instant::now();
        let state = self.state.read();
        state
            .sessions
            .get(session_id)
            .filter(|s| !s.is_expired(now, state.sessions.timeout()))
            .cloned()
    }

    /// Probe `id` now and wait for the result.
    pub async fn force_health_check(&self, id: &str) -> Result<HealthStatus> {
        self.checker.force_check(id).await
    }

    /// Probe every server now. Returns how many were probed.
    pub async fn force_health_check_all(&self) -> usize {
        self.checker.force_check_all().await
    }

    pub fn set_health_check_interval(&self, interval: Duration) {
        self.checker.set_interval(interval);
    }

    pub fn set_health_check_timeout(&self, timeout: Duration) {
        self.checker.set_timeout(timeout);
    }

    pub fn health_checker(&self) -> &HealthChecker {
        &self.checker
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().servers.iter().any(|s| s.id() == id)
    }

    /// Server ids in registration order.
    pub fn server_ids(&self) -> Vec<String> {
        self.state
            .read()
            .servers
            .iter()
            .map(|s| s.id().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consistent snapshot of the pool, taken under one read lock.
    pub fn stats(&self) -> RegistryStats {
        let now = Instant::now();
        let state = self.state.read();

        let mut stats = RegistryStats {
            total_servers: state.servers.len(),
            healthy_servers: 0,
            unhealthy_servers: 0,
            unknown_servers: 0,
            total_connections: 0,
            strategy: self.algorithm,
            sticky_session: self.sticky_session,
            active_sessions: state.sessions.active(now),
            servers: Vec::with_capacity(state.servers.len()),
        };

        for server in &state.servers {
            match server.health() {
                HealthStatus::Healthy => stats.healthy_servers += 1,
                HealthStatus::Unhealthy => stats.unhealthy_servers += 1,
                HealthStatus::Unknown => stats.unknown_servers += 1,
            }
            let connections = server.connections();
            stats.total_connections += connections;
            stats.servers.push(ServerStats {
                id: server.id().to_string(),
                address: server.address().to_string(),
                port: server.port(),
                weight: server.weight(),
                connections,
                health: server.health(),
                since_health_change: now.saturating_duration_since(server.last_health_change()),
            });
        }

        stats
    }

    /// Overall pool health.
    pub fn health_summary(&self) -> HealthSummary {
        let state = self.state.read();
        let total = state.servers.len();
        let healthy = state.servers.iter().filter(|s| s.is_healthy()).count();

        let status = if healthy == 0 {
            PoolHealth::Unhealthy
        } else if healthy < total {
            PoolHealth::Degraded
        } else {
            PoolHealth::Healthy
        };

        HealthSummary {
            status,
            healthy_servers: healthy,
            total_servers: total,
            health_percentage: if total == 0 {
                0.0
            } else {
                healthy as f64 / total as f64 * 100.0
            },
        }
    }

    /// Stop every monitor, close every connection and forget all servers
    /// and sessions.
    pub async fn close(&self) {
        self.checker.shutdown().await;

        let servers = {
            let mut state = self.state.write();
            state.sessions.clear();
            std::mem::take(&mut state.servers)
        };

        for server in &servers {
            server.connection().close().await;
            self.metrics.remove_server(server.id());
        }

        info!(servers = servers.len(), "registry closed");
    }
}

impl Drop for ServerRegistry {
    fn drop(&mut self) {
        self.checker.cancel_all();
    }
}

/// Per-server part of [`RegistryStats`].
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStats {
    pub id: String,
    pub address: String,
    pub port: u16,
    pub weight: u32,
    pub connections: u64,
    pub health: HealthStatus,
    pub since_health_change: Duration,
}

/// Snapshot of the registry for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStats {
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub unhealthy_servers: usize,
    pub unknown_servers: usize,
    pub total_connections: u64,
    pub strategy: Algorithm,
    pub sticky_session: bool,
    pub active_sessions: usize,
    pub servers: Vec<ServerStats>,
}

/// Overall pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    /// Every server is healthy.
    Healthy,
    /// Some, but not all, servers are healthy.
    Degraded,
    /// No server is healthy (or there are none).
    Unhealthy,
}

impl PoolHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolHealth::Healthy => "healthy",
            PoolHealth::Degraded => "degraded",
            PoolHealth::Unhealthy => "unhealthy",
        }
    }
}

/// Result of [`ServerRegistry::health_summary`].
#[derive(Debug, Clone, PartialEq)]
pub struct HealthSummary {
    pub status: PoolHealth,
    pub healthy_servers: usize,
    pub total_servers: usize,
    pub health_percentage: f64,
}
