//! rpclb - client-side load balancing for RPC calls
//!
//! This crate routes calls across a pool of backend servers without a
//! central proxy:
//! - A server registry with round robin, random, weighted and least
//!   connections selection, plus optional sticky sessions
//! - One background health probe loop per server
//! - A call wrapper that retries and fails over with linear backoff
//! - Hot reload of health check settings and Prometheus metrics
//!
//! The wire protocol is pluggable through [`transport::Connector`].

pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod transport;
pub mod util;

pub use client::{CallContext, LoadBalancedClient, RetryPolicy};
pub use config::Config;
pub use error::{LbError, Result};
pub use registry::ServerRegistry;
