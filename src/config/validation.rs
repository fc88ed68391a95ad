//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check that every derived channel name can be built
//! - Validate value ranges (pool size > 0, metrics address parses)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BridgeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::BridgeConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("bridge.node_uri {value:?} is not a valid URI: {reason}")]
    InvalidNodeUri { value: String, reason: String },

    #[error("bridge.{field} must be a non-empty name without '/'")]
    InvalidChannelName { field: &'static str },

    #[error("pool.max_workers must be greater than zero")]
    ZeroWorkers,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Check a loaded configuration for semantic errors.
pub fn validate_config(config: &BridgeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Err(e) = Url::parse(&config.bridge.node_uri) {
        errors.push(ValidationError::InvalidNodeUri {
            value: config.bridge.node_uri.clone(),
            reason: e.to_string(),
        });
    }

    let names = [
        ("command_channel", &config.bridge.command_channel),
        ("data_channel_prefix", &config.bridge.data_channel_prefix),
        ("data_return_channel_prefix", &config.bridge.data_return_channel_prefix),
    ];
    for (field, value) in names {
        if value.trim().is_empty() || value.contains('/') {
            errors.push(ValidationError::InvalidChannelName { field });
        }
    }

    if config.pool.max_workers == 0 {
        errors.push(ValidationError::ZeroWorkers);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
