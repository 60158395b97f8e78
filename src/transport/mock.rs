//! In-memory transport for unit tests.

use super::{CallStream, Connection, Connector, Metadata, Status};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A connection with switchable readiness and scripted call results.
///
/// Calls pop results off the script and echo the request once it is empty.
#[derive(Default)]
pub(crate) struct MockConnection {
    ready: AtomicBool,
    script: Mutex<VecDeque<Result<Bytes, Status>>>,
    always: Mutex<Option<Status>>,
    delay: Mutex<Duration>,
    ready_delay: Mutex<Duration>,
    readiness_checks: AtomicUsize,
    calls: AtomicUsize,
    streams: AtomicUsize,
    closed: AtomicUsize,
}

impl MockConnection {
    pub(crate) fn new(ready: bool) -> Arc<Self> {
        let conn = Self::default();
        conn.ready.store(ready, Ordering::SeqCst);
        Arc::new(conn)
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Queue the result of the next call.
    pub(crate) fn push(&self, result: Result<Bytes, Status>) {
        self.script.lock().push_back(result);
    }

    /// Fail every unscripted call with `status`.
    pub(crate) fn fail_always(&self, status: Status) {
        *self.always.lock() = Some(status);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Slow down readiness checks by `delay`.
    pub(crate) fn set_ready_delay(&self, delay: Duration) {
        *self.ready_delay.lock() = delay;
    }

    pub(crate) fn readiness_checks(&self) -> usize {
        self.readiness_checks.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn streams(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn next(&self, request: Bytes) -> Result<Bytes, Status> {
        if let Some(result) = self.script.lock().pop_front() {
            return result;
        }
        match self.always.lock().clone() {
            Some(status) => Err(status),
            None => Ok(request),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn is_ready(&self) -> Result<bool, Status> {
        self.readiness_checks.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ready_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.ready.load(Ordering::SeqCst))
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn invoke(&self, _method: &str, request: Bytes) -> Result<Bytes, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.next(request)
    }

    async fn open_stream(&self, _method: &str) -> Result<Box<dyn CallStream>, Status> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        self.next(Bytes::new())?;
        Ok(Box::new(EchoStream::default()))
    }
}

/// Echoes every sent message back after the send side is closed.
#[derive(Default)]
pub(crate) struct EchoStream {
    pending: VecDeque<Bytes>,
    half_closed: bool,
}

#[async_trait]
impl CallStream for EchoStream {
    async fn header(&mut self) -> Result<Metadata, Status> {
        Ok(Metadata::from([("server".to_string(), "mock".to_string())]))
    }

    fn trailer(&self) -> Metadata {
        Metadata::new()
    }

    async fn send(&mut self, message: Bytes) -> Result<(), Status> {
        if self.half_closed {
            return Err(Status::internal("send after close_send"));
        }
        self.pending.push_back(message);
        Ok(())
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.half_closed = true;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, Status> {
        Ok(self.pending.pop_front())
    }
}

/// Hands out [`MockConnection`]s keyed by `address:port`, creating ready
/// ones on demand.
#[derive(Default)]
pub(crate) struct MockConnector {
    connections: DashMap<String, Arc<MockConnection>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The connection for `address:port`, created ready if absent.
    pub(crate) fn connection(&self, address: &str, port: u16) -> Arc<MockConnection> {
        Arc::clone(
            self.connections
                .entry(format!("{address}:{port}"))
                .or_insert_with(|| MockConnection::new(true))
                .value(),
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, address: &str, port: u16) -> Result<Arc<dyn Connection>, Status> {
        let conn: Arc<dyn Connection> = self.connection(address, port);
        Ok(conn)
    }
}
