//! Sticky-session bindings.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A binding of a caller supplied session key to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub server_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

impl Session {
    pub(crate) fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_used_at) > timeout
    }
}

/// Session table. Lives inside the registry state, so it is always accessed
/// under the registry lock.
///
/// Expired bindings are dropped when looked up, and binding sweeps the whole
/// table at most once per timeout period.
#[derive(Debug)]
pub(crate) struct SessionTable {
    sessions: HashMap<String, Session>,
    timeout: Duration,
    last_sweep: Instant,
}

impl SessionTable {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            timeout,
            last_sweep: Instant::now(),
        }
    }

    /// Server bound to `session_id`, if the binding has not expired.
    /// Expired bindings are dropped on the way.
    pub(crate) fn lookup(&mut self, session_id: &str, now: Instant) -> Option<&str> {
        let expired = self
            .sessions
            .get(session_id)
            .map(|s| s.is_expired(now, self.timeout))?;
        if expired {
            self.sessions.remove(session_id);
            return None;
        }
        self.sessions.get(session_id).map(|s| s.server_id.as_str())
    }

    pub(crate) fn touch(&mut self, session_id: &str, now: Instant) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_used_at = now;
        }
    }

    /// Bind (or rebind) a session to a server.
    pub(crate) fn bind(&mut self, session_id: &str, server_id: &str, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) >= self.timeout {
            self.sweep(now);
        }
        self.sessions.insert(
            session_id.to_string(),
            Session {
                session_id: session_id.to_string(),
                server_id: server_id.to_string(),
                created_at: now,
                last_used_at: now,
            },
        );
    }

    fn sweep(&mut self, now: Instant) {
        let timeout = self.timeout;
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now, timeout));
        self.last_sweep = now;

        let dropped = before - self.sessions.len();
        if dropped > 0 {
            debug!(dropped, remaining = self.sessions.len(), "swept expired sessions");
        }
    }

    pub(crate) fn remove(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Drop every binding to `server_id`. Returns how many were dropped.
    pub(crate) fn remove_server(&mut self, server_id: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.server_id != server_id);
        before - self.sessions.len()
    }

    /// Bindings that have not expired at `now`.
    pub(crate) fn active(&self, now: Instant) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.is_expired(now, self.timeout))
            .count()
    }

    pub(crate) fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn clear(&mut self) {
        self.sessions.clear();
    }
}
