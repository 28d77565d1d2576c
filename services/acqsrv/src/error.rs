//! Error handling for the acquisition service

use thiserror::Error;

/// Acquisition service error type
#[derive(Error, Debug, Clone)]
pub enum AcqError {
    /// Configuration-related errors (unknown driver type, missing field,
    /// invalid poll group reference); the offending upsert is refused
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Socket-level failures; retried with backoff
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Malformed payloads, unsupported addresses, unknown message kinds
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Rejected credentials or TLS verification failure; never auto-retried
    #[error("Auth error: {0}")]
    AuthError(String),

    /// Operation exceeded its deadline
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// Bus publish/subscribe failures
    #[error("Bus error: {0}")]
    BusError(String),

    /// Metadata store failures
    #[error("Store error: {0}")]
    StoreError(String),

    /// Connection registry errors (not found, exists, wrong kind)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Tag-level errors (unknown id, bad address for the driver kind)
    #[error("Tag error: {0}")]
    TagError(String),

    /// Operation aborted by disconnect or delete; treated as silent success
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Everything else
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the acquisition service
pub type Result<T> = std::result::Result<T, AcqError>;

impl AcqError {
    pub fn config(msg: impl Into<String>) -> Self {
        AcqError::ConfigError(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        AcqError::TransportError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        AcqError::ProtocolError(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        AcqError::AuthError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        AcqError::TimeoutError(msg.into())
    }

    pub fn bus(msg: impl Into<String>) -> Self {
        AcqError::BusError(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        AcqError::StoreError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        AcqError::ConnectionError(msg.into())
    }

    pub fn tag(msg: impl Into<String>) -> Self {
        AcqError::TagError(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        AcqError::Cancelled(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AcqError::InternalError(msg.into())
    }

    pub fn connection_not_found(id: impl std::fmt::Display) -> Self {
        AcqError::ConnectionError(format!("Connection not found: {}", id))
    }

    /// True when the failure should not trigger a reconnect loop
    pub fn is_fatal_for_connect(&self) -> bool {
        matches!(self, AcqError::AuthError(_) | AcqError::ConfigError(_))
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for AcqError {
    fn from(err: std::io::Error) -> Self {
        AcqError::TransportError(err.to_string())
    }
}

impl From<serde_json::Error> for AcqError {
    fn from(err: serde_json::Error) -> Self {
        AcqError::ProtocolError(format!("JSON: {err}"))
    }
}

impl From<sqlx::Error> for AcqError {
    fn from(err: sqlx::Error) -> Self {
        AcqError::StoreError(err.to_string())
    }
}

impl From<edge_model::ModelError> for AcqError {
    fn from(err: edge_model::ModelError) -> Self {
        AcqError::ConfigError(err.to_string())
    }
}

impl From<anyhow::Error> for AcqError {
    fn from(err: anyhow::Error) -> Self {
        AcqError::InternalError(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AcqError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AcqError::TimeoutError("Deadline exceeded".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convenience_constructors() {
        let err = AcqError::connection_not_found("plc-1");
        assert!(err.to_string().contains("plc-1"));

        let err = AcqError::protocol("bad frame");
        assert!(matches!(err, AcqError::ProtocolError(_)));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(AcqError::auth("rejected").is_fatal_for_connect());
        assert!(AcqError::config("missing host").is_fatal_for_connect());
        assert!(!AcqError::transport("refused").is_fatal_for_connect());
        assert!(!AcqError::timeout("read").is_fatal_for_connect());
    }
}
