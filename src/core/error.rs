//! Request-level failure taxonomy and its mapping onto HTTP status codes.
//!
//! Every kind that is not absorbed by retries maps to exactly one status. The
//! synthesized body is a small JSON document that never carries destination
//! addresses or internal detail; the `Display` text (which may) is only for logs.
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderValue, Response, StatusCode, header};
use serde_json::json;
use thiserror::Error;

/// Failures surfaced while handling a single inbound request, plus
/// `ConfigurationInvalid` which is only ever raised when publishing a snapshot.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("no route matches {method} {path}")]
    RouteNotFound { method: String, path: String },

    #[error("authentication denied: {reason}")]
    AuthenticationDenied { reason: String },

    #[error("authorization denied for subject '{subject}'")]
    AuthorizationDenied { subject: String },

    #[error("rate limited: {message}")]
    RateLimited { status: StatusCode, message: String },

    #[error("no healthy destination in cluster '{cluster_id}'")]
    NoHealthyDestination { cluster_id: String },

    #[error("circuit open for destination '{destination_id}' in cluster '{cluster_id}'")]
    CircuitOpen {
        cluster_id: String,
        destination_id: String,
    },

    #[error("connection to destination '{destination_id}' failed: {reason}")]
    ConnectionFailure {
        destination_id: String,
        reason: String,
    },

    #[error("downstream call exceeded {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("downstream processing failed: {reason}")]
    DownstreamProcessingFailure { reason: String },

    #[error("aggregate sub-requests failed: {}", failed_keys.join(", "))]
    AggregatePartialFailure { failed_keys: Vec<String> },

    #[error("invalid configuration: {reason}")]
    ConfigurationInvalid { reason: String },
}

impl GatewayError {
    /// Boundary status for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::AuthenticationDenied { .. } => StatusCode::UNAUTHORIZED,
            GatewayError::AuthorizationDenied { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { status, .. } => *status,
            GatewayError::NoHealthyDestination { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ConnectionFailure { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DownstreamProcessingFailure { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::AggregatePartialFailure { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::ConfigurationInvalid { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code used in bodies, events and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::RouteNotFound { .. } => "route_not_found",
            GatewayError::AuthenticationDenied { .. } => "authentication_denied",
            GatewayError::AuthorizationDenied { .. } => "authorization_denied",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::NoHealthyDestination { .. } => "no_healthy_destination",
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::ConnectionFailure { .. } => "connection_failure",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::DownstreamProcessingFailure { .. } => "downstream_processing_failure",
            GatewayError::AggregatePartialFailure { .. } => "aggregate_partial_failure",
            GatewayError::ConfigurationInvalid { .. } => "configuration_invalid",
        }
    }

    /// Whether the resilience wrapper may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::ConnectionFailure { .. })
    }

    /// Build the synthesized response for this failure.
    pub fn to_response(&self) -> Response<Bytes> {
        let status = self.status_code();
        let message = match self {
            // the configured message is operator-provided, so it is safe to echo
            GatewayError::RateLimited { message, .. } => message.clone(),
            _ => status
                .canonical_reason()
                .unwrap_or("Gateway Error")
                .to_string(),
        };

        let body = match self {
            GatewayError::AggregatePartialFailure { failed_keys } => json!({
                "error": self.code(),
                "message": message,
                "failed_keys": failed_keys,
            }),
            _ => json!({ "error": self.code(), "message": message }),
        };

        let mut response = Response::new(Bytes::from(body.to_string()));
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}
