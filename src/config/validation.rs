//! Configuration validation.
//!
//! Semantic checks only; serde handles syntax. Returns every problem found
//! rather than stopping at the first one.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::GatewayConfig;
use crate::load_balancer::endpoint::Endpoint;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "admin.bind_address",
            format!("not a socket address: {}", config.admin.bind_address),
        ));
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("not a socket address: {}", config.observability.metrics_address),
        ));
    }

    let pool = &config.pool;
    if pool.max_connections == 0 {
        errors.push(ValidationError::new("pool.max_connections", "must be > 0"));
    }
    if pool.connect_timeout_secs == 0 {
        errors.push(ValidationError::new("pool.connect_timeout_secs", "must be > 0"));
    }
    if pool.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("pool.sweep_interval_secs", "must be > 0"));
    }

    let cb = &config.circuit_breaker;
    if cb.failure_threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.failure_threshold", "must be > 0"));
    }
    if cb.half_open_max_calls == 0 {
        errors.push(ValidationError::new("circuit_breaker.half_open_max_calls", "must be > 0"));
    }
    if cb.success_threshold == 0 || cb.success_threshold > cb.half_open_max_calls {
        errors.push(ValidationError::new(
            "circuit_breaker.success_threshold",
            "must be between 1 and half_open_max_calls",
        ));
    }

    let dispatch = &config.dispatch;
    if dispatch.max_retries == 0 {
        errors.push(ValidationError::new("dispatch.max_retries", "must be > 0"));
    }
    if dispatch.request_timeout_secs == 0 {
        errors.push(ValidationError::new("dispatch.request_timeout_secs", "must be > 0"));
    }
    if dispatch.backoff_base_ms > dispatch.backoff_max_ms {
        errors.push(ValidationError::new(
            "dispatch.backoff_base_ms",
            "must not exceed backoff_max_ms",
        ));
    }

    if config.health_check.enabled
        && (config.health_check.interval_secs == 0 || config.health_check.timeout_secs == 0)
    {
        errors.push(ValidationError::new(
            "health_check",
            "interval_secs and timeout_secs must be > 0",
        ));
    }

    let mut names = HashSet::new();
    for (i, service) in config.services.iter().enumerate() {
        let prefix = format!("services[{i}]");
        if service.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{prefix}.name"), "must not be empty"));
        } else if !names.insert(service.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{prefix}.name"),
                format!("duplicate service name {}", service.name),
            ));
        }
        if service.endpoints.is_empty() {
            errors.push(ValidationError::new(
                format!("{prefix}.endpoints"),
                "at least one endpoint is required",
            ));
        }
        for (j, address) in service.endpoints.iter().enumerate() {
            if let Err(e) = Endpoint::parse(&service.name, j, address) {
                errors.push(ValidationError::new(format!("{prefix}.endpoints[{j}]"), e));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ServiceConfig, Strategy};

    fn service(name: &str, endpoints: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            strategy: Strategy::RoundRobin,
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let mut config = GatewayConfig::default();
        config
            .services
            .push(service("static-analyzer", &["ws://127.0.0.1:2001", "127.0.0.1:2002"]));
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = GatewayConfig::default();
        config.pool.max_connections = 0;
        config.circuit_breaker.success_threshold = 10;
        config.services.push(service("dup", &["ws://127.0.0.1:1"]));
        config.services.push(service("dup", &["http://127.0.0.1:2"]));
        config.services.push(service("empty", &[]));

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"pool.max_connections"));
        assert!(fields.contains(&"circuit_breaker.success_threshold"));
        assert!(fields.contains(&"services[1].name"));
        assert!(fields.contains(&"services[1].endpoints[0]"));
        assert!(fields.contains(&"services[2].endpoints"));
    }
}
