//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (addresses parse, limits non-zero, ratios in range)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RuntimeConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::RuntimeConfig;

/// Log levels accepted by `--log.level`.
pub const LOG_LEVELS: [&str; 4] = ["error", "warn", "info", "debug"];

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check `config`, collecting every problem found.
pub fn validate_config(config: &RuntimeConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if !LOG_LEVELS.contains(&config.log.level.as_str()) {
        errors.push(ValidationError::new(
            "log.level",
            format!("must be one of {}, got {:?}", LOG_LEVELS.join(", "), config.log.level),
        ));
    }

    check_address(&mut errors, "http.bind_address", &config.http.bind_address);
    check_address(&mut errors, "grpc.bind_address", &config.grpc.bind_address);

    if config.grpc.max_send_message_bytes == 0 {
        errors.push(ValidationError::new("grpc.max_send_message_bytes", "must be greater than zero"));
    }
    if config.grpc.max_recv_message_bytes == 0 {
        errors.push(ValidationError::new("grpc.max_recv_message_bytes", "must be greater than zero"));
    }
    if config.grpc.max_send_message_bytes > u32::MAX as usize {
        errors.push(ValidationError::new(
            "grpc.max_send_message_bytes",
            "must fit in a 4-byte message length",
        ));
    }

    if !(0.0..=1.0).contains(&config.tracing.sample_ratio) {
        errors.push(ValidationError::new(
            "tracing.sample_ratio",
            format!("must be between 0 and 1, got {}", config.tracing.sample_ratio),
        ));
    }
    if config.tracing.enabled && config.tracing.service_name.trim().is_empty() {
        errors.push(ValidationError::new("tracing.service_name", "must not be empty when tracing is enabled"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_address(errors: &mut Vec<ValidationError>, field: &'static str, value: &str) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("{value:?} is not a host:port address")));
    }
}
