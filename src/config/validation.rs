//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0 and bounded, buffer sizes > 0)
//! - Check the TLS policy leaves at least one negotiable version
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AdmissionConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::{
    AdmissionConfig, MAX_DETECTION_TIMEOUT_MS, MAX_HANDSHAKE_TIMEOUT_SECS, MAX_RESOLVER_TIMEOUT_MS,
};
use crate::net::tls::effective_versions;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.host must not be empty")]
    EmptyHost,

    #[error("listener.max_pending_connections must be greater than zero")]
    NoPendingSlots,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("{field} must not exceed {max}")]
    DurationTooLong { field: &'static str, max: u64 },

    #[error("detection.max_buffer_bytes must be greater than zero")]
    ZeroDetectionBuffer,

    #[error("detection marker must not be empty")]
    EmptyMarker,

    #[error("detection marker {marker:?} is longer than max_buffer_bytes ({limit})")]
    MarkerTooLong { marker: String, limit: usize },

    #[error("tls.{0} must not be empty")]
    EmptyPath(&'static str),

    #[error("tls policy leaves no negotiable protocol version")]
    NoProtocolVersions,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    BadMetricsAddress(String),

    #[error("reactor.events_capacity must be greater than zero")]
    NoEventCapacity,
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &AdmissionConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.host.trim().is_empty() {
        errors.push(ValidationError::EmptyHost);
    }
    if config.listener.max_pending_connections == 0 {
        errors.push(ValidationError::NoPendingSlots);
    }

    check_duration(
        &mut errors,
        "detection.timeout_ms",
        config.detection.timeout_ms,
        MAX_DETECTION_TIMEOUT_MS,
    );
    if config.detection.max_buffer_bytes == 0 {
        errors.push(ValidationError::ZeroDetectionBuffer);
    }
    for marker in &config.detection.markers {
        if marker.is_empty() {
            errors.push(ValidationError::EmptyMarker);
        } else if marker.len() > config.detection.max_buffer_bytes {
            errors.push(ValidationError::MarkerTooLong {
                marker: marker.clone(),
                limit: config.detection.max_buffer_bytes,
            });
        }
    }

    check_duration(
        &mut errors,
        "handshake.timeout_secs",
        config.handshake.timeout_secs,
        MAX_HANDSHAKE_TIMEOUT_SECS,
    );
    check_duration(
        &mut errors,
        "resolver.timeout_ms",
        config.resolver.timeout_ms,
        MAX_RESOLVER_TIMEOUT_MS,
    );
    if config.reactor.poll_interval_ms == 0 {
        errors.push(ValidationError::ZeroDuration("reactor.poll_interval_ms"));
    }
    if config.reactor.events_capacity == 0 {
        errors.push(ValidationError::NoEventCapacity);
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::EmptyPath("cert_path"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::EmptyPath("key_path"));
        }
        if matches!(tls.ca_path.as_deref(), Some("")) {
            errors.push(ValidationError::EmptyPath("ca_path"));
        }
        if effective_versions(tls.accepted_mask(), tls.excluded_mask()).is_empty() {
            errors.push(ValidationError::NoProtocolVersions);
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::BadMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_duration(errors: &mut Vec<ValidationError>, field: &'static str, value: u64, max: u64) {
    if value == 0 {
        errors.push(ValidationError::ZeroDuration(field));
    } else if value > max {
        errors.push(ValidationError::DurationTooLong { field, max });
    }
}
