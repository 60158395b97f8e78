//! TCP reference connector.
//!
//! Readiness is a plain TCP connect to the server within the probe timeout.
//! No call protocol is spoken over these connections, so call execution
//! reports `Unimplemented`; plug a protocol-specific [`Connector`] in for that.

use super::{CallStream, Connection, Connector, Status};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Creates [`TcpConnection`]s. Connecting is lazy: nothing is dialed until
/// the first readiness probe.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    /// Create a connector whose dials give up after `connect_timeout`.
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str, port: u16) -> Result<Arc<dyn Connection>, Status> {
        if address.is_empty() {
            return Err(Status::new(
                super::Code::InvalidArgument,
                "server address cannot be empty",
            ));
        }
        Ok(Arc::new(TcpConnection::new(
            format_target(address, port),
            self.connect_timeout,
        )))
    }
}

/// A lazily dialed TCP connection handle.
#[derive(Debug)]
pub struct TcpConnection {
    target: String,
    connect_timeout: Duration,
    closed: AtomicBool,
}

impl TcpConnection {
    fn new(target: String, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// The `host:port` this connection dials.
    pub fn target(&self) -> &str {
        &self.target
    }

    fn ensure_open(&self) -> Result<(), Status> {
        if self.closed.load(Ordering::Acquire) {
            Err(Status::unavailable(format!("connection to {} is closed", self.target)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn is_ready(&self) -> Result<bool, Status> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(false);
        }

        match timeout(self.connect_timeout, TcpStream::connect(self.target.as_str())).await {
            Ok(Ok(_stream)) => Ok(true),
            Ok(Err(e)) => {
                debug!(target = %self.target, error = %e, "tcp dial failed");
                Err(Status::unavailable(format!("connection failed: {}", e)))
            }
            Err(_) => Err(Status::deadline_exceeded("connection timeout")),
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(target = %self.target, "tcp connection closed");
        }
    }

    async fn invoke(&self, method: &str, _request: Bytes) -> Result<Bytes, Status> {
        self.ensure_open()?;
        Err(Status::unimplemented(format!(
            "tcp connector cannot execute call {}",
            method
        )))
    }

    async fn open_stream(&self, method: &str) -> Result<Box<dyn CallStream>, Status> {
        self.ensure_open()?;
        Err(Status::unimplemented(format!(
            "tcp connector cannot open stream {}",
            method
        )))
    }
}

/// Join host and port, bracketing bare IPv6 literals.
fn format_target(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}
