//! Health checking for backend servers.

mod checker;
mod passive;

pub use checker::{HealthChecker, HealthReporter, ProbeSettings};
pub use passive::FailureReporter;
