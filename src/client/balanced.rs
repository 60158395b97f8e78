//! The retrying, failing-over call loop.

use crate::client::retry::{RetryPolicy, is_connection_error, is_retryable};
use crate::client::{BalancedStream, CallContext, ConnectionGuard};
use crate::config::BalancerConfig;
use crate::error::{LbError, Result};
use crate::health::FailureReporter;
use crate::metrics::MetricsCollector;
use crate::registry::{SelectedServer, ServerRegistry};
use crate::transport::{Connection, Status};
use crate::util::generate_call_id;
use bytes::Bytes;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout};
use tracing::{Instrument, debug, info, info_span, warn};

/// Routes calls across the registry's healthy servers with retries and
/// failover.
pub struct LoadBalancedClient {
    registry: Arc<ServerRegistry>,
    policy: RetryPolicy,
    connections: DashMap<String, Arc<dyn Connection>>,
    failures: FailureReporter,
    metrics: MetricsCollector,
}

impl LoadBalancedClient {
    pub fn new(registry: Arc<ServerRegistry>, policy: RetryPolicy) -> Self {
        Self {
            failures: FailureReporter::new(Arc::clone(&registry)),
            metrics: registry.metrics().clone(),
            registry,
            policy,
            connections: DashMap::new(),
        }
    }

    pub fn from_config(registry: Arc<ServerRegistry>, config: &BalancerConfig) -> Self {
        Self::new(registry, RetryPolicy::from_config(config))
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Execute a unary call.
    pub async fn invoke(&self, ctx: &CallContext, method: &str, request: Bytes) -> Result<Bytes> {
        let span = info_span!("invoke", call_id = %generate_call_id(), method = %method);
        self.execute(ctx, method, |connection, guard| {
            let request = request.clone();
            async move {
                let response = connection.invoke(method, request).await;
                drop(guard);
                response
            }
        })
        .instrument(span)
        .await
    }

    /// Open a streaming call.
    ///
    /// Only opening the stream is retried. Once open, failures are reported
    /// by the stream itself.
    pub async fn new_stream(&self, ctx: &CallContext, method: &str) -> Result<BalancedStream> {
        let span = info_span!("new_stream", call_id = %generate_call_id(), method = %method);
        self.execute(ctx, method, |connection, guard| async move {
            let inner = connection.open_stream(method).await?;
            Ok::<_, Status>(BalancedStream::new(guard, inner))
        })
        .instrument(span)
        .await
    }

    /// Number of cached per-server connection handles.
    pub fn cached_connections(&self) -> usize {
        self.connections.len()
    }

    /// Forget every cached connection handle. The connections themselves
    /// stay owned, and are closed, by the registry.
    pub fn close(&self) {
        let dropped = self.connections.len();
        self.connections.clear();
        info!(dropped, "load-balanced client closed");
    }

    async fn execute<T, F, Fut>(&self, ctx: &CallContext, method: &str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn Connection>, ConnectionGuard) -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        let started = Instant::now();
        let attempts = self.run_attempts(ctx, method, &call);

        let result = if self.policy.failover_timeout.is_zero() {
            attempts.await
        } else {
            match timeout(self.policy.failover_timeout, attempts).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout = ?self.policy.failover_timeout, "failover timeout elapsed");
                    Err(LbError::FailoverTimeout(self.policy.failover_timeout))
                }
            }
        };

        self.metrics
            .record_call(method, result.is_ok(), started.elapsed());
        result
    }

    async fn run_attempts<T, F, Fut>(&self, ctx: &CallContext, method: &str, call: &F) -> Result<T>
    where
        F: Fn(Arc<dyn Connection>, ConnectionGuard) -> Fut,
        Fut: Future<Output = std::result::Result<T, Status>>,
    {
        let attempts = self.policy.attempts();
        let mut attempt = 0;

        loop {
            if ctx.is_cancelled() {
                return Err(LbError::Cancelled);
            }
            let last = attempt + 1 >= attempts;

            let server = match self.registry.select(ctx.session_id()) {
                Ok(server) => server,
                Err(e) if last => {
                    warn!(attempt, error = %e, "no server available on final attempt");
                    return Err(LbError::Unavailable);
                }
                Err(e) => {
                    debug!(attempt, error = %e, "selection failed, backing off");
                    self.back_off(ctx, method, attempt).await?;
                    attempt += 1;
                    continue;
                }
            };

            let connection = self.connection_for(&server);
            let guard = ConnectionGuard::acquire(Arc::clone(&self.registry), &server);
            let status = match self.attempt(ctx, call(connection, guard)).await? {
                Ok(value) => {
                    debug!(attempt, server_id = %server.id(), "call succeeded");
                    return Ok(value);
                }
                Err(status) => status,
            };

            if !is_retryable(&status) {
                warn!(attempt, server_id = %server.id(), error = %status, "non-retryable failure");
                return Err(LbError::Rpc(status));
            }

            if is_connection_error(&status) {
                debug!(server_id = %server.id(), "connection-level failure, forcing probe");
                self.failures.connection_failed(server.id());
            }

            if last {
                warn!(attempts, server_id = %server.id(), error = %status, "max retries exceeded");
                return Err(LbError::RetriesExhausted {
                    attempts,
                    last: status,
                });
            }

            warn!(attempt, server_id = %server.id(), error = %status, "retryable failure");
            self.back_off(ctx, method, attempt).await?;
            attempt += 1;
        }
    }

    /// Run one attempt, racing it against cancellation and the per-attempt
    /// timeout. The outer error is cancellation only.
    async fn attempt<T>(
        &self,
        ctx: &CallContext,
        call: impl Future<Output = std::result::Result<T, Status>>,
    ) -> Result<std::result::Result<T, Status>> {
        let bounded = async {
            match ctx.attempt_timeout() {
                Some(limit) => timeout(limit, call).await.unwrap_or_else(|_| {
                    Err(Status::deadline_exceeded(format!(
                        "attempt timed out after {limit:?}"
                    )))
                }),
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(LbError::Cancelled),
            result = bounded => Ok(result),
        }
    }

    async fn back_off(&self, ctx: &CallContext, method: &str, attempt: u32) -> Result<()> {
        self.metrics.record_retry(method);
        let delay = self.policy.backoff(attempt);

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(LbError::Cancelled),
            _ = sleep(delay) => Ok(()),
        }
    }

    /// Cached connection handle for `server`, refreshed when the registry
    /// holds a different one (the id was removed and added again).
    fn connection_for(&self, server: &SelectedServer) -> Arc<dyn Connection> {
        let mut entry = self
            .connections
            .entry(server.id().to_string())
            .or_insert_with(|| Arc::clone(server.connection()));

        if !Arc::ptr_eq(entry.value(), server.connection()) {
            debug!(server_id = %server.id(), "refreshing cached connection");
            *entry.value_mut() = Arc::clone(server.connection());
        }
        Arc::clone(entry.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Algorithm;
    use crate::registry::HealthStatus;
    use crate::transport::Code;
    use crate::transport::mock::{MockConnection, MockConnector};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn config() -> BalancerConfig {
        BalancerConfig {
            strategy: Algorithm::RoundRobin,
            health_check_interval: Duration::from_secs(3600),
            health_check_timeout: Duration::from_secs(1),
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
            failover_timeout: Duration::ZERO,
            ..BalancerConfig::default()
        }
    }

    async fn wait_for(registry: &ServerRegistry, id: &str, status: HealthStatus) {
        for _ in 0..200 {
            if registry.health(id) == Some(status) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("{id} never became {status}");
    }

    /// Registry with servers `s0..sN` on ports 1..=N and their mock connections.
    async fn pool(
        config: &BalancerConfig,
        n: u16,
    ) -> (Arc<ServerRegistry>, Vec<Arc<MockConnection>>) {
        let connector = MockConnector::new();
        let registry = ServerRegistry::new(config, connector.clone());
        let mut conns = Vec::new();
        for i in 0..n {
            let id = format!("s{i}");
            registry.add_server(&id, "10.0.0.1", i + 1, 1).await.unwrap();
            wait_for(&registry, &id, HealthStatus::Healthy).await;
            conns.push(connector.connection("10.0.0.1", i + 1));
        }
        (registry, conns)
    }

    #[tokio::test]
    async fn test_invoke_success() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let response = client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::from_static(b"hi"))
            .await
            .unwrap();

        assert_eq!(response, Bytes::from_static(b"hi"));
        assert_eq!(conns[0].calls(), 1);
        assert_eq!(registry.connections("s0"), Some(0));
        assert_eq!(client.cached_connections(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        conns[0].push(Err(Status::internal("hiccup")));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let response = client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(response, Bytes::from_static(b"x"));
        assert_eq!(conns[0].calls(), 2);
        assert_eq!(registry.connections("s0"), Some(0));
    }

    #[tokio::test]
    async fn test_fails_over_to_next_server() {
        let config = config();
        let (registry, conns) = pool(&config, 2).await;
        conns[0].fail_always(Status::unavailable("down"));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::new())
            .await
            .unwrap();

        assert_eq!(conns[0].calls(), 1);
        assert_eq!(conns[1].calls(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_passes_through() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        conns[0].push(Err(Status::new(Code::InvalidArgument, "bad request")));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let err = client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::new())
            .await
            .unwrap_err();

        assert!(matches!(&err, LbError::Rpc(s) if s.message() == "bad request"));
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(conns[0].calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_keeps_last_error() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        conns[0].fail_always(Status::internal("still broken"));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let err = client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::new())
            .await
            .unwrap_err();

        match &err {
            LbError::RetriesExhausted { attempts, last } => {
                assert_eq!(*attempts, 3);
                assert_eq!(last.code(), Code::Internal);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(conns[0].calls(), 3);
        assert_eq!(registry.connections("s0"), Some(0));
    }

    #[tokio::test]
    async fn test_no_healthy_server_never_calls() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        conns[0].set_ready(false);
        registry.force_health_check("s0").await.unwrap();
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let err = client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LbError::Unavailable));
        assert_eq!(conns[0].calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let token = CancellationToken::new();
        token.cancel();
        let ctx = CallContext::new().with_cancellation(token);

        let err = client.invoke(&ctx, "/svc/Echo", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, LbError::Cancelled));
        assert_eq!(conns[0].calls(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let config = BalancerConfig {
            retry_delay: Duration::from_secs(30),
            ..config()
        };
        let (registry, conns) = pool(&config, 1).await;
        conns[0].fail_always(Status::internal("boom"));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let started = Instant::now();
        let err = client.invoke(&ctx, "/svc/Echo", Bytes::new()).await.unwrap_err();
        assert!(matches!(err, LbError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(conns[0].calls(), 1);
    }

    #[tokio::test]
    async fn test_failover_timeout() {
        let config = BalancerConfig {
            retry_delay: Duration::from_millis(200),
            failover_timeout: Duration::from_millis(50),
            ..config()
        };
        let (registry, conns) = pool(&config, 1).await;
        conns[0].fail_always(Status::internal("boom"));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let err = client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LbError::FailoverTimeout(_)));
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert_eq!(registry.connections("s0"), Some(0));
    }

    #[tokio::test]
    async fn test_failover_timeout_bounds_single_slow_call() {
        let bounded = BalancerConfig {
            failover_timeout: Duration::from_millis(50),
            ..config()
        };
        let (registry, conns) = pool(&bounded, 1).await;
        conns[0].set_delay(Duration::from_millis(150));

        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &bounded);
        let err = client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LbError::FailoverTimeout(_)));
        assert_eq!(conns[0].calls(), 1);

        let unbounded = LoadBalancedClient::from_config(Arc::clone(&registry), &config());
        let response = unbounded
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::from_static(b"slow"))
            .await
            .unwrap();
        assert_eq!(response, Bytes::from_static(b"slow"));
        assert_eq!(conns[0].calls(), 2);
        assert_eq!(registry.connections("s0"), Some(0));
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out_and_is_retried() {
        let config = BalancerConfig {
            max_retries: 1,
            ..config()
        };
        let (registry, conns) = pool(&config, 1).await;
        conns[0].set_delay(Duration::from_secs(5));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        let err = client.invoke(&ctx, "/svc/Echo", Bytes::new()).await.unwrap_err();

        match err {
            LbError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert_eq!(last.code(), Code::DeadlineExceeded);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(conns[0].calls(), 2);
        assert_eq!(registry.connections("s0"), Some(0));
    }

    #[tokio::test]
    async fn test_stream_releases_once_on_close_send() {
        let config = config();
        let (registry, _conns) = pool(&config, 1).await;
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);
        let ctx = CallContext::new();

        let mut first = client.new_stream(&ctx, "/svc/Chat").await.unwrap();
        let _second = client.new_stream(&ctx, "/svc/Chat").await.unwrap();
        assert_eq!(first.server_id(), "s0");
        assert_eq!(registry.connections("s0"), Some(2));

        first.send(Bytes::from_static(b"ping")).await.unwrap();
        first.close_send().await.unwrap();
        assert!(first.is_released());
        assert_eq!(registry.connections("s0"), Some(1));

        first.close_send().await.unwrap();
        drop(first);
        assert_eq!(registry.connections("s0"), Some(1));
    }

    #[tokio::test]
    async fn test_stream_forwards_and_releases_on_drop() {
        let config = config();
        let (registry, _conns) = pool(&config, 1).await;
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let mut stream = client
            .new_stream(&CallContext::new(), "/svc/Chat")
            .await
            .unwrap();
        assert_eq!(
            stream.header().await.unwrap().get("server").map(String::as_str),
            Some("mock")
        );
        stream.send(Bytes::from_static(b"a")).await.unwrap();
        stream.send(Bytes::from_static(b"b")).await.unwrap();
        assert_eq!(stream.recv().await.unwrap(), Some(Bytes::from_static(b"a")));
        assert_eq!(registry.connections("s0"), Some(1));

        drop(stream);
        assert_eq!(registry.connections("s0"), Some(0));
    }

    #[tokio::test]
    async fn test_failed_stream_open_releases_slot() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        conns[0].fail_always(Status::new(Code::PermissionDenied, "nope"));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        let err = client
            .new_stream(&CallContext::new(), "/svc/Chat")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
        assert_eq!(conns[0].streams(), 1);
        assert_eq!(registry.connections("s0"), Some(0));
    }

    #[tokio::test]
    async fn test_connection_cache_refreshes_after_readd() {
        let config = config();
        let connector = MockConnector::new();
        let registry = ServerRegistry::new(&config, connector.clone());
        registry.add_server("s0", "10.0.0.1", 1, 1).await.unwrap();
        wait_for(&registry, "s0", HealthStatus::Healthy).await;
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);
        let ctx = CallContext::new();

        client.invoke(&ctx, "/svc/Echo", Bytes::new()).await.unwrap();
        registry.remove_server("s0").await.unwrap();
        registry.add_server("s0", "10.0.0.1", 2, 1).await.unwrap();
        wait_for(&registry, "s0", HealthStatus::Healthy).await;
        client.invoke(&ctx, "/svc/Echo", Bytes::new()).await.unwrap();

        assert_eq!(connector.connection("10.0.0.1", 1).calls(), 1);
        assert_eq!(connector.connection("10.0.0.1", 2).calls(), 1);
        assert_eq!(client.cached_connections(), 1);

        client.close();
        assert_eq!(client.cached_connections(), 0);
    }

    #[tokio::test]
    async fn test_call_metrics() {
        let config = config();
        let (registry, conns) = pool(&config, 1).await;
        conns[0].push(Err(Status::unavailable("blip")));
        let client = LoadBalancedClient::from_config(Arc::clone(&registry), &config);

        client
            .invoke(&CallContext::new(), "/svc/Echo", Bytes::new())
            .await
            .unwrap();

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, registry.metrics().registry())
            .unwrap();
        assert!(out.contains("rpclb_calls_total{method=\"/svc/Echo\",result=\"Success\"} 1"));
        assert!(out.contains("rpclb_retries_total{method=\"/svc/Echo\"} 1"));
    }
}
