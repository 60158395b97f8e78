//! Transport abstraction consumed by the balancer.
//!
//! The balancer never speaks a wire protocol itself. It asks a [`Connector`]
//! for one [`Connection`] per registered server and drives unary and
//! streaming calls through it. Payloads are opaque byte buffers.

#[cfg(test)]
pub(crate) mod mock;
mod status;
mod tcp;

pub use status::{Code, Status};
pub use tcp::{TcpConnection, TcpConnector};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Header or trailer metadata of a streaming call.
pub type Metadata = BTreeMap<String, String>;

/// Establishes connections to backend servers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Create a connection handle for `address:port`.
    async fn connect(&self, address: &str, port: u16) -> Result<Arc<dyn Connection>, Status>;
}

/// A connection to a single backend server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Whether the connection is ready to carry calls.
    async fn is_ready(&self) -> Result<bool, Status>;

    /// Close the connection. Calling this more than once must be harmless.
    async fn close(&self);

    /// Execute a unary call.
    async fn invoke(&self, method: &str, request: Bytes) -> Result<Bytes, Status>;

    /// Open a bidirectional stream.
    async fn open_stream(&self, method: &str) -> Result<Box<dyn CallStream>, Status>;
}

/// An open streaming call.
#[async_trait]
pub trait CallStream: Send {
    /// Wait for the response headers.
    async fn header(&mut self) -> Result<Metadata, Status>;

    /// Trailers, available once the stream has finished.
    fn trailer(&self) -> Metadata;

    /// Send a message.
    async fn send(&mut self, message: Bytes) -> Result<(), Status>;

    /// Signal that no more messages will be sent.
    async fn close_send(&mut self) -> Result<(), Status>;

    /// Receive the next message, or `None` once the server has finished.
    async fn recv(&mut self) -> Result<Option<Bytes>, Status>;
}
