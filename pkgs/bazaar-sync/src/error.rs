//! Error types for conversation sync operations

use thiserror::Error;

use crate::offer::OfferStatus;

/// Failures reported by the backend collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors that can occur in sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("No authenticated user")]
    NotAuthenticated,
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Invalid price: {0}")]
    InvalidPrice(String),
    #[error("Invalid offer transition: {from:?} -> {to:?}")]
    InvalidTransition { from: OfferStatus, to: OfferStatus },
    #[error("Subscription error: {0}")]
    Subscription(String),
}
