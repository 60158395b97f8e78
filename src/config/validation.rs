//! Configuration validation.

use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - Non-empty, unique server ids
/// - Non-empty server addresses and non-zero ports
/// - Usable health check interval and timeout
/// - A session timeout when sticky sessions are enabled
/// - A known log level
///
/// Weight 0 is allowed: such servers are skipped by weighted selection only.
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    let mut server_ids = HashSet::new();
    for server in &config.servers {
        if server.id.is_empty() {
            errors.push("server id cannot be empty".to_string());
        } else if !server_ids.insert(server.id.as_str()) {
            errors.push(format!("duplicate server id: {}", server.id));
        }

        if server.address.is_empty() {
            errors.push(format!("server '{}' has an empty address", server.id));
        }

        if server.port == 0 {
            errors.push(format!("server '{}' has port 0", server.id));
        }
    }

    let balancer = &config.balancer;
    if balancer.health_check_interval.is_zero() {
        errors.push("health_check_interval must be greater than zero".to_string());
    }

    if balancer.health_check_timeout.is_zero() {
        errors.push("health_check_timeout must be greater than zero".to_string());
    } else if balancer.health_check_timeout > balancer.health_check_interval
        && !balancer.health_check_interval.is_zero()
    {
        errors.push(format!(
            "health_check_timeout ({:?}) exceeds health_check_interval ({:?})",
            balancer.health_check_timeout, balancer.health_check_interval
        ));
    }

    if balancer.sticky_session && balancer.session_timeout.is_zero() {
        errors.push("session_timeout must be greater than zero when sticky_session is enabled".to_string());
    }

    // Validate log level
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
