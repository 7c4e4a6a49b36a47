//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, timeouts > 0)
//! - Detect duplicate backend identifiers and unparsable addresses
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use url::Url;
use crate::config::schema::ProxyConfig;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
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

pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let mut seen = HashSet::new();
    for (i, backend) in config.backends.iter().enumerate() {
        let field = format!("backends[{i}]");
        if backend.id.trim().is_empty() {
            errors.push(ValidationError::new(&field, "id must not be empty"));
        }
        if !seen.insert(backend.id.as_str()) {
            errors.push(ValidationError::new(&field, format!("duplicate id {}", backend.id)));
        }
        if backend.weight == 0 {
            errors.push(ValidationError::new(&field, "weight must be positive"));
        }
        if let Err(reason) = validate_address(&backend.address) {
            errors.push(ValidationError::new(&field, reason));
        }
    }

    if config.circuit_breaker.threshold == 0 {
        errors.push(ValidationError::new("circuit_breaker.threshold", "must be positive"));
    }
    if config.pool.max_connections_per_backend == 0 {
        errors.push(ValidationError::new("pool.max_connections_per_backend", "must be positive"));
    }
    if config.pool.connect_timeout_ms == 0 {
        errors.push(ValidationError::new("pool.connect_timeout_ms", "must be positive"));
    }
    if config.timeouts.request_ms == 0 {
        errors.push(ValidationError::new("timeouts.request_ms", "must be positive"));
    }
    if config.health_check.enabled {
        if config.health_check.interval_secs == 0 {
            errors.push(ValidationError::new("health_check.interval_secs", "must be positive"));
        }
        if !config.health_check.path.starts_with('/') {
            errors.push(ValidationError::new("health_check.path", "must start with '/'"));
        }
    }
    if config.cache.enabled && config.cache.max_entries == 0 {
        errors.push(ValidationError::new("cache.max_entries", "must be positive when cache is enabled"));
    }
    if config.admin.enabled && config.admin.api_key.trim().is_empty() {
        errors.push(ValidationError::new("admin.api_key", "must be set when the admin API is enabled"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Check that an address is an absolute http(s) URL with a host.
pub fn validate_address(address: &str) -> Result<Url, String> {
    let url = Url::parse(address).map_err(|e| format!("invalid address {address}: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme {}", url.scheme()));
    }
    if url.host_str().is_none() {
        return Err(format!("address {address} has no host"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn test_default_is_valid() {
        assert!(validate_config(&ProxyConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_backend_errors() {
        let mut config = ProxyConfig::default();
        config.backends.push(BackendConfig::new("a", "http://127.0.0.1:1"));
        config.backends.push(BackendConfig::new("a", "ftp://127.0.0.1:2"));
        config.backends.push(BackendConfig {
            weight: 0,
            ..BackendConfig::new("", "not a url")
        });

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["backends[1]", "backends[1]", "backends[2]", "backends[2]", "backends[2]"]);
    }
}
