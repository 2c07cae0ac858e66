//! Error types for the CA gateway.
//!
//! This module defines the gateway error taxonomy. Every failure a request
//! can hit while it travels through the responder is classified into one of
//! the [`ErrorKind`]s, which decides both how the failure is surfaced on the
//! wire and at which severity it is audited.

use std::time::Duration;

use thiserror::Error;

use crate::audit::AuditLevel;
use crate::backend::BackendError;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Coarse classification of a [`GatewayError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The client sent something that could not be decoded or validated.
    MalformedRequest,
    /// Proof-of-possession signing or the signer pool failed.
    SigningError,
    /// No pooled signer became free within the borrow timeout.
    ResourceExhausted,
    /// The CA backend rejected the request or could not be reached.
    BackendError,
    /// Anything else. Never surfaced to the client in detail.
    InternalFault,
}

impl ErrorKind {
    /// Returns the taxonomy name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedRequest => "MALFORMED_REQUEST",
            Self::SigningError => "SIGNING_ERROR",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::BackendError => "BACKEND_ERROR",
            Self::InternalFault => "INTERNAL_FAULT",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while handling a gateway request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Request body, path or metadata could not be decoded or validated.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// No protocol is mounted at the request path, or the protocol does not
    /// know the requested operation.
    #[error("Unknown path: {0}")]
    UnknownPath(String),

    /// The operation exists but not for this HTTP method.
    #[error("Method {method} not allowed for {operation}")]
    MethodNotAllowed {
        /// HTTP method received.
        method: String,
        /// Protocol operation addressed.
        operation: String,
    },

    /// A client signature over its own request did not verify.
    #[error("Proof of possession failed: {0}")]
    BadPop(String),

    /// The request is well formed but its sender may not perform it.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// Proof-of-possession signing failed.
    #[error("Signing error: {0}")]
    Signing(String),

    /// Signer pool was exhausted for the whole borrow timeout.
    #[error("Signer pool '{pool}' exhausted after waiting {waited:?}")]
    ResourceExhausted {
        /// Pool name.
        pool: String,
        /// How long the borrower waited.
        waited: Duration,
    },

    /// Classified failure of the CA backend.
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create a malformed request error with the given message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedRequest(msg.into())
    }

    /// Create an unknown path error.
    pub fn unknown_path(path: impl Into<String>) -> Self {
        Self::UnknownPath(path.into())
    }

    /// Create a method-not-allowed error.
    pub fn method_not_allowed(method: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::MethodNotAllowed {
            method: method.into(),
            operation: operation.into(),
        }
    }

    /// Create an error for a client signature that does not verify.
    pub fn bad_pop(msg: impl Into<String>) -> Self {
        Self::BadPop(msg.into())
    }

    /// Create an error for a sender that may not perform the operation.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a signing error with the given message.
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Create a resource exhausted error.
    pub fn resource_exhausted(pool: impl Into<String>, waited: Duration) -> Self {
        Self::ResourceExhausted {
            pool: pool.into(),
            waited,
        }
    }

    /// Create a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedRequest(_)
            | Self::UnknownPath(_)
            | Self::MethodNotAllowed { .. }
            | Self::BadPop(_)
            | Self::Unauthorized(_) => ErrorKind::MalformedRequest,
            Self::Signing(_) => ErrorKind::SigningError,
            Self::ResourceExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Backend(BackendError::Unexpected(_)) => ErrorKind::InternalFault,
            Self::Backend(_) => ErrorKind::BackendError,
            Self::Config(_) | Self::Internal(_) | Self::Io(_) => ErrorKind::InternalFault,
        }
    }

    /// Severity at which this error is audited.
    ///
    /// Client-caused and capacity failures are WARN; everything that points
    /// at the gateway or its infrastructure is ERROR.
    pub fn audit_level(&self) -> AuditLevel {
        match self {
            Self::Backend(err) => err.audit_level(),
            _ => match self.kind() {
                ErrorKind::MalformedRequest | ErrorKind::ResourceExhausted => AuditLevel::Warn,
                _ => AuditLevel::Error,
            },
        }
    }

    /// Returns true if the client may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ResourceExhausted { .. } => true,
            Self::Backend(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Suggested `Retry-After` value in seconds for retryable errors.
    pub fn retry_after(&self) -> Option<u64> {
        self.is_retryable().then_some(DEFAULT_RETRY_AFTER_SECS)
    }
}

/// Retry hint handed to clients when the gateway is temporarily saturated.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
