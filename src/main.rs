//! rpclb - client-side RPC load balancer
//!
//! Usage:
//!     rpclb --config <path>
//!
//! Registers the configured servers, keeps them health checked and exposes
//! pool metrics. See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use rpclb::config::{Config, ConfigWatcher, load_config};
use rpclb::metrics::{MetricsCollector, MetricsServer};
use rpclb::registry::ServerRegistry;
use rpclb::transport::TcpConnector;
use rpclb::util::{ShutdownSignal, init_logging, wait_for_signal};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Client-side load balancing with health checking and failover.
#[derive(Parser, Debug)]
#[command(name = "rpclb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, config.global.log_format).context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Strategy: {}", config.balancer.strategy);
        println!("  Sticky sessions: {}", config.balancer.sticky_session);
        println!("  Servers: {}", config.servers.len());
        for server in &config.servers {
            println!(
                "    - {} ({}:{}, weight {})",
                server.id, server.address, server.port, server.weight
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        servers = config.servers.len(),
        strategy = %config.balancer.strategy,
        "rpclb starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run(cli.config, config))
}

async fn run(config_path: PathBuf, config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let connector = Arc::new(TcpConnector::new(config.balancer.health_check_timeout));
    let registry =
        ServerRegistry::with_metrics(&config.balancer, connector, MetricsCollector::new());

    for server in &config.servers {
        registry
            .add_server(&server.id, &server.address, server.port, server.weight)
            .await
            .with_context(|| format!("failed to add server '{}'", server.id))?;
    }

    let mut handles = Vec::new();

    if config.global.metrics.enabled {
        let metrics = MetricsServer::new(
            config.global.metrics.address,
            config.global.metrics.path.clone(),
            Arc::clone(&registry),
        );
        let rx = shutdown.subscribe();
        handles.push(tokio::spawn(metrics.run(rx)));
    }

    let reload_target = Arc::downgrade(&registry);
    let watcher = ConfigWatcher::new(
        config_path,
        Box::new(move |new: Config| {
            let Some(registry) = reload_target.upgrade() else {
                return;
            };
            registry.set_health_check_interval(new.balancer.health_check_interval);
            registry.set_health_check_timeout(new.balancer.health_check_timeout);
            if new.servers.len() != registry.len() || new.balancer.strategy != registry.algorithm()
            {
                warn!("server list and strategy changes require a restart");
            }
        }),
    );
    handles.push(tokio::spawn(watcher.run(shutdown.subscribe())));

    let stats_registry = Arc::clone(&registry);
    let stats_token = shutdown.token();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = stats_registry.stats();
                    info!(
                        total = stats.total_servers,
                        healthy = stats.healthy_servers,
                        unhealthy = stats.unhealthy_servers,
                        unknown = stats.unknown_servers,
                        connections = stats.total_connections,
                        sessions = stats.active_sessions,
                        "pool stats"
                    );
                }
                _ = stats_token.cancelled() => break,
            }
        }
    }));

    info!("rpclb is running");
    info!("press Ctrl+C to stop");

    let signal = wait_for_signal().await;
    info!(signal, "received shutdown signal");

    shutdown.shutdown();
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task failed");
        }
    }
    registry.close().await;

    info!("rpclb shut down complete");
    Ok(())
}
