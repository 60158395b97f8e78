//! Configuration file watcher for hot reload.
//!
//! Only the runtime-adjustable knobs (health check interval and timeout) are
//! applied by the binary on reload; the server set is not reconciled.

use crate::config::{Config, load_config};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Callback type for config reload.
pub type ReloadCallback = Box<dyn Fn(Config) + Send + Sync>;

/// Configuration file watcher.
pub struct ConfigWatcher {
    config_path: PathBuf,
    reload_callback: ReloadCallback,
}

impl ConfigWatcher {
    /// Create a new config watcher.
    pub fn new(config_path: PathBuf, reload_callback: ReloadCallback) -> Self {
        Self {
            config_path,
            reload_callback,
        }
    }

    /// Get the path being watched.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Watch for file changes and SIGHUP until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, mut events) = mpsc::unbounded_channel();
        let watcher_result: Result<RecommendedWatcher, _> = Watcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        );

        // Keeps the watcher alive for the duration of the loop.
        let _watcher = match watcher_result {
            Ok(mut watcher) => {
                let dir = self
                    .config_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                match watcher.watch(dir, RecursiveMode::NonRecursive) {
                    Ok(()) => Some(watcher),
                    Err(e) => {
                        error!(error = %e, "failed to watch config directory");
                        None
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to create file watcher");
                None
            }
        };

        #[cfg(unix)]
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => Some(s),
                Err(e) => {
                    warn!(error = %e, "failed to setup SIGHUP handler");
                    None
                }
            };

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if self.should_reload(&event) {
                        self.try_reload();
                    }
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        match sighup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending::<Option<()>>().await,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload();
                }

                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    /// Whether a file system event concerns our config file.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        is_our_file && matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
    }

    /// Reload the file; a config that fails to load or validate is dropped.
    fn try_reload(&self) {
        match load_config(&self.config_path) {
            Ok(config) => {
                info!(
                    servers = config.servers.len(),
                    strategy = %config.balancer.strategy,
                    "configuration reloaded"
                );
                (self.reload_callback)(config);
            }
            Err(e) => {
                error!(error = %e, "failed to reload config, keeping current");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_watcher(path: &str) -> ConfigWatcher {
        ConfigWatcher::new(PathBuf::from(path), Box::new(|_| {}))
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event {
            kind,
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_should_reload_modify() {
        let watcher = noop_watcher("/etc/rpclb/pool.yaml");
        let modify = EventKind::Modify(notify::event::ModifyKind::Data(
            notify::event::DataChange::Content,
        ));
        assert!(watcher.should_reload(&event(modify, "/etc/rpclb/pool.yaml")));
    }

    #[test]
    fn test_should_reload_create() {
        let watcher = noop_watcher("/etc/rpclb/pool.yaml");
        let create = EventKind::Create(notify::event::CreateKind::File);
        assert!(watcher.should_reload(&event(create, "/etc/rpclb/pool.yaml")));
    }

    #[test]
    fn test_ignores_other_files_and_removal() {
        let watcher = noop_watcher("/etc/rpclb/pool.yaml");
        let create = EventKind::Create(notify::event::CreateKind::File);
        let remove = EventKind::Remove(notify::event::RemoveKind::File);
        assert!(!watcher.should_reload(&event(create, "/etc/rpclb/other.yaml")));
        assert!(!watcher.should_reload(&event(remove, "/etc/rpclb/pool.yaml")));
    }

    #[test]
    fn test_try_reload_invokes_callback_only_for_valid_config() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"balancer:\n  health_check_interval: 5s\n  health_check_timeout: 1s\n")
            .unwrap();

        let watcher = ConfigWatcher::new(
            file.path().to_path_buf(),
            Box::new(move |config| {
                assert_eq!(config.balancer.health_check_interval, Duration::from_secs(5));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        watcher.try_reload();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        std::fs::write(file.path(), "global:\n  log_level: loud\n").unwrap();
        watcher.try_reload();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
