//! Streaming call handle.

use crate::client::ConnectionGuard;
use crate::transport::{CallStream, Metadata, Status};
use bytes::Bytes;

/// A stream opened through [`LoadBalancedClient::new_stream`](crate::client::LoadBalancedClient::new_stream).
///
/// The chosen server's in-flight counter is released exactly once: on the
/// first [`close_send`](Self::close_send), or when the handle is dropped if
/// the send side was never closed.
pub struct BalancedStream {
    server_id: String,
    inner: Box<dyn CallStream>,
    guard: Option<ConnectionGuard>,
}

impl BalancedStream {
    pub(crate) fn new(guard: ConnectionGuard, inner: Box<dyn CallStream>) -> Self {
        Self {
            server_id: guard.server_id().to_string(),
            inner,
            guard: Some(guard),
        }
    }

    /// Id of the server carrying this stream.
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub async fn header(&mut self) -> Result<Metadata, Status> {
        self.inner.header().await
    }

    pub fn trailer(&self) -> Metadata {
        self.inner.trailer()
    }

    pub async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        self.inner.send(message).await
    }

    /// Half-close the stream and release the server's in-flight slot.
    ///
    /// The slot is released even if the transport reports an error.
    pub async fn close_send(&mut self) -> Result<(), Status> {
        let result = self.inner.close_send().await;
        self.guard.take();
        result
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        self.inner.recv().await
    }

    /// Whether the in-flight slot has been given back.
    pub fn is_released(&self) -> bool {
        self.guard.is_none()
    }
}

impl std::fmt::Debug for BalancedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancedStream")
            .field("server_id", &self.server_id)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}
