//! Active health checker.
//!
//! Runs one probe loop per server. A loop probes immediately on start and
//! then once per interval, pushing every result through a [`HealthReporter`].
//! Forced checks are queued to the same loop, so no probe of a server
//! outlives its monitor. The checker never touches server state itself.

use crate::error::{LbError, Result};
use crate::metrics::MetricsCollector;
use crate::registry::HealthStatus;
use crate::transport::Connection;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callback receiving probe results.
///
/// Called with the server id, the generation the monitor was started for
/// and the status.
pub type HealthReporter = Arc<dyn Fn(&str, u64, HealthStatus) + Send + Sync>;

/// Probe cadence and bound. Adjustable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

type ForcedCheck = oneshot::Sender<HealthStatus>;

/// A running probe loop, detached from the checker once stopped.
pub(crate) struct Monitor {
    forced: mpsc::UnboundedSender<ForcedCheck>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Monitor {
    /// Wait for the cancelled loop to exit, forced checks included.
    pub(crate) async fn join(self, id: &str) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(server_id = %id, error = %e, "health monitor ended abnormally");
        }
        debug!(server_id = %id, "health monitor stopped");
    }
}

/// Active health checker that probes backend servers.
pub struct HealthChecker {
    settings: Arc<ArcSwap<ProbeSettings>>,
    monitors: DashMap<String, Monitor>,
    reporter: HealthReporter,
    shutdown: CancellationToken,
    metrics: MetricsCollector,
}

impl HealthChecker {
    /// Create a health checker. No loop runs until [`start`](Self::start).
    pub fn new(settings: ProbeSettings, reporter: HealthReporter, metrics: MetricsCollector) -> Self {
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            monitors: DashMap::new(),
            reporter,
            shutdown: CancellationToken::new(),
            metrics,
        }
    }

    /// Start monitoring generation `generation` of `id`. Must be called from
    /// within a tokio runtime.
    ///
    /// A second start for an id that is already monitored is ignored.
    pub fn start(&self, id: &str, generation: u64, connection: Arc<dyn Connection>) {
        match self.monitors.entry(id.to_string()) {
            Entry::Occupied(_) => {
                warn!(server_id = %id, "health monitor already running");
            }
            Entry::Vacant(slot) => {
                let cancel = self.shutdown.child_token();
                let (forced, requests) = mpsc::unbounded_channel();
                let monitor_loop = MonitorLoop {
                    id: id.to_string(),
                    generation,
                    connection,
                    settings: Arc::clone(&self.settings),
                    reporter: Arc::clone(&self.reporter),
                    metrics: self.metrics.clone(),
                };
                let task = tokio::spawn(monitor_loop.run(requests, cancel.clone()));
                slot.insert(Monitor {
                    forced,
                    cancel,
                    task,
                });
                debug!(server_id = %id, generation, "health monitor started");
            }
        }
    }

    /// Remove and cancel the monitor for `id` without waiting for it.
    ///
    /// The caller joins the returned monitor. Nothing it does is reported
    /// once the join completes.
    pub(crate) fn detach(&self, id: &str) -> Option<Monitor> {
        let (_, monitor) = self.monitors.remove(id)?;
        monitor.cancel.cancel();
        Some(monitor)
    }

    /// Stop monitoring `id` and wait for its loop to exit.
    ///
    /// Returns false if `id` was not monitored.
    pub async fn stop(&self, id: &str) -> bool {
        match self.detach(id) {
            Some(monitor) => {
                monitor.join(id).await;
                true
            }
            None => false,
        }
    }

    /// Stop every loop and wait for all of them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let ids: Vec<String> = self.monitors.iter().map(|m| m.key().clone()).collect();
        let detached: Vec<(String, Monitor)> = ids
            .into_iter()
            .filter_map(|id| self.detach(&id).map(|monitor| (id, monitor)))
            .collect();
        let stopped = detached.len();
        join_all(
            detached
                .into_iter()
                .map(|(id, monitor)| async move { monitor.join(&id).await }),
        )
        .await;

        info!(monitors = stopped, "health checker stopped");
    }

    /// Signal every loop to stop without waiting.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    /// Probe `id` right away and report the result.
    ///
    /// The probe runs on the server's own loop. Fails with `NotFound` if
    /// `id` is not monitored or its monitor is stopped before the probe
    /// completes.
    pub async fn force_check(&self, id: &str) -> Result<HealthStatus> {
        let (reply, status) = oneshot::channel();
        let queued = self
            .monitors
            .get(id)
            .is_some_and(|m| m.forced.send(reply).is_ok());
        if !queued {
            return Err(LbError::NotFound(id.to_string()));
        }

        let status = status
            .await
            .map_err(|_| LbError::NotFound(id.to_string()))?;
        info!(server_id = %id, %status, "forced health check");
        Ok(status)
    }

    /// Probe every monitored server concurrently. Returns how many were probed.
    pub async fn force_check_all(&self) -> usize {
        let ids = self.monitored();
        let probed = join_all(ids.iter().map(|id| self.force_check(id)))
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count();

        info!(servers = probed, "forced health check for all servers");
        probed
    }

    /// Change the probe interval. Running loops pick it up on their next wait.
    pub fn set_interval(&self, interval: Duration) {
        self.settings.rcu(|current| ProbeSettings {
            interval,
            ..**current
        });
        info!(interval = ?interval, "updated health check interval");
    }

    /// Change the probe timeout. Applies to the next probe.
    pub fn set_timeout(&self, timeout: Duration) {
        self.settings.rcu(|current| ProbeSettings {
            timeout,
            ..**current
        });
        info!(timeout = ?timeout, "updated health check timeout");
    }

    pub fn settings(&self) -> ProbeSettings {
        **self.settings.load()
    }

    /// Ids of the servers currently monitored.
    pub fn monitored(&self) -> Vec<String> {
        self.monitors.iter().map(|m| m.key().clone()).collect()
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.monitors.contains_key(id)
    }
}

/// Probe loop for one server instance.
struct MonitorLoop {
    id: String,
    generation: u64,
    connection: Arc<dyn Connection>,
    settings: Arc<ArcSwap<ProbeSettings>>,
    reporter: HealthReporter,
    metrics: MetricsCollector,
}

impl MonitorLoop {
    /// Exits only on cancellation. A forced check cuts the current wait
    /// short and is answered with the probe that follows.
    async fn run(
        self,
        mut forced: mpsc::UnboundedReceiver<ForcedCheck>,
        cancel: CancellationToken,
    ) {
        let mut waiting: Option<ForcedCheck> = None;

        loop {
            let current = **self.settings.load();

            let status = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                status = run_probe(
                    &self.id,
                    self.connection.as_ref(),
                    current.timeout,
                    &self.metrics,
                ) => status,
            };
            (self.reporter)(self.id.as_str(), self.generation, status);
            if let Some(reply) = waiting.take() {
                let _ = reply.send(status);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(reply) = forced.recv() => waiting = Some(reply),
                _ = sleep(current.interval) => {}
            }
        }

        debug!(server_id = %self.id, "health monitor exiting");
    }
}

/// Probe once and translate the outcome into a status.
async fn run_probe(
    id: &str,
    connection: &dyn Connection,
    probe_timeout: Duration,
    metrics: &MetricsCollector,
) -> HealthStatus {
    let result = check_connection(connection, probe_timeout).await;
    metrics.record_health_check(id, result.is_ok());

    match result {
        Ok(()) => {
            debug!(server_id = %id, "health check passed");
            HealthStatus::Healthy
        }
        Err(e) => {
            warn!(server_id = %id, error = %e, "health check failed");
            HealthStatus::Unhealthy
        }
    }
}

/// Ask the connection whether it is ready, within `probe_timeout`.
async fn check_connection(
    connection: &dyn Connection,
    probe_timeout: Duration,
) -> std::result::Result<(), String> {
    match timeout(probe_timeout, connection.is_ready()).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err("connection not ready".to_string()),
        Ok(Err(e)) => Err(format!("readiness check failed: {}", e)),
        Err(_) => Err("health check timeout".to_string()),
    }
}
