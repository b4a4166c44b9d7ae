//! Gateway error types.
//!
//! Transient broker failures are recovered by the reconnect supervisor and
//! only reach callers as a rejected publish. Registration failures (access
//! denied, assertion failure, not connected) are returned to the caller.

use thiserror::Error;

/// AMQP reply code for "not found" (missing queue or exchange).
pub const AMQP_NOT_FOUND: u16 = 404;

/// Gateway error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    /// No broker connection or channel is currently available.
    #[error("Not connected to message broker")]
    NotConnected,

    /// Broker operation failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Caller may not consume from the requested queue.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Token could not be decoded, verified or issued.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Store collaborator failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Sign-in collaborator failed.
    #[error("Sign-in error: {0}")]
    Signin(String),

    /// Client socket transport failed.
    #[error("Socket transport error: {0}")]
    Transport(String),

    /// Duplicate registration (correlation id or queue name already active).
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Broker management API request failed.
    #[error("Management API error: {0}")]
    Management(String),

    /// Pending reply was discarded before it settled.
    #[error("Reply channel dropped")]
    ReplyDropped,

    /// Internal error with context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns a bounded label string for the error variant (for metrics).
    pub fn error_type_label(&self) -> &'static str {
        match self {
            GatewayError::NotConnected => "not_connected",
            GatewayError::Broker(_) => "broker",
            GatewayError::AccessDenied(_) => "access_denied",
            GatewayError::InvalidToken(_) => "invalid_token",
            GatewayError::Store(_) => "store",
            GatewayError::Signin(_) => "signin",
            GatewayError::Transport(_) => "transport",
            GatewayError::Conflict(_) => "conflict",
            GatewayError::InvalidArgument(_) => "invalid_argument",
            GatewayError::Management(_) => "management",
            GatewayError::ReplyDropped => "reply_dropped",
            GatewayError::Internal(_) => "internal",
        }
    }
}

/// Failure reported by a broker transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("broker operation failed (code {code:?}): {message}")]
pub struct BrokerError {
    /// AMQP reply code when the broker supplied one.
    pub code: Option<u16>,
    pub message: String,
}

impl BrokerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Missing queue/exchange. Expected during normal operation.
    pub fn is_not_found(&self) -> bool {
        self.code == Some(AMQP_NOT_FOUND)
    }
}

impl From<BrokerError> for GatewayError {
    fn from(err: BrokerError) -> Self {
        GatewayError::Broker(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_bounded_and_distinct() {
        let errors = [
            GatewayError::NotConnected,
            GatewayError::Broker("x".into()),
            GatewayError::AccessDenied("x".into()),
            GatewayError::InvalidToken("x".into()),
            GatewayError::Store("x".into()),
            GatewayError::Signin("x".into()),
            GatewayError::Transport("x".into()),
            GatewayError::Conflict("x".into()),
            GatewayError::InvalidArgument("x".into()),
            GatewayError::Management("x".into()),
            GatewayError::ReplyDropped,
            GatewayError::Internal("x".into()),
        ];
        let mut labels: Vec<_> = errors.iter().map(GatewayError::error_type_label).collect();
        labels.sort_unstable();
        labels.dedup();
        assert_eq!(labels.len(), errors.len());
    }

    #[test]
    fn test_not_found_code() {
        assert!(BrokerError::with_code(AMQP_NOT_FOUND, "no queue 'x'").is_not_found());
        assert!(!BrokerError::with_code(320, "connection forced").is_not_found());
        assert!(!BrokerError::new("io").is_not_found());
    }
}
