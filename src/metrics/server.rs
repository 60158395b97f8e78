//! Prometheus metrics HTTP server.
//!
//! Serves metrics and the pool health summary on a configurable address.

use crate::registry::{PoolHealth, ServerRegistry};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, header};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    /// Address to bind.
    address: SocketAddr,
    /// Path for metrics endpoint.
    path: String,
    /// Source of metrics and health.
    registry: Arc<ServerRegistry>,
}

impl MetricsServer {
    pub fn new(address: SocketAddr, path: String, registry: Arc<ServerRegistry>) -> Self {
        Self {
            address,
            path,
            registry,
        }
    }

    /// Run the metrics server until `shutdown` fires.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let listener = match TcpListener::bind(self.address).await {
            Ok(l) => l,
            Err(e) => {
                error!(error = %e, address = %self.address, "failed to bind metrics server");
                return;
            }
        };

        info!(address = %self.address, path = %self.path, "metrics server started");

        let registry = self.registry;
        let path = Arc::new(self.path);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let registry = Arc::clone(&registry);
                            let path = Arc::clone(&path);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                                    let response = respond(req.method(), req.uri().path(), &registry, &path);
                                    async move { Ok::<_, Infallible>(response) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

/// Route a request to its response.
fn respond(
    method: &Method,
    path: &str,
    registry: &ServerRegistry,
    metrics_path: &str,
) -> Response<Full<Bytes>> {
    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n".to_string());
    }

    if path == metrics_path {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, registry.metrics().registry()) {
            error!(error = %e, "failed to encode metrics");
            return text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics\n".to_string(),
            );
        }
        let mut response = text(StatusCode::OK, buffer);
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        );
        response
    } else if path == "/health" || path == "/healthz" {
        let summary = registry.health_summary();
        let status = match summary.status {
            PoolHealth::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            PoolHealth::Healthy | PoolHealth::Degraded => StatusCode::OK,
        };
        text(
            status,
            format!(
                "{} ({}/{} servers healthy, {:.1}%)\n",
                summary.status.as_str(),
                summary.healthy_servers,
                summary.total_servers,
                summary.health_percentage
            ),
        )
    } else if path == "/" {
        text(
            StatusCode::OK,
            format!(
                "rpclb metrics server\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Pool health\n",
                metrics_path
            ),
        )
    } else {
        text(StatusCode::NOT_FOUND, "Not found\n".to_string())
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/plain"));
    response
}
