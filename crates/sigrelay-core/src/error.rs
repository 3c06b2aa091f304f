//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Every drawn channel code collided with a live channel.
    #[error("channel id space exhausted after {attempts} attempts")]
    IdSpaceExhausted { attempts: u32 },

    /// Generator was configured with values it cannot draw from
    #[error("invalid generator configuration: {reason}")]
    InvalidGenerator { reason: String },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
