//! Crate-level error types.
//!
//! [`BatchSyncError`] unifies every error source (configuration, HTTP,
//! JSON, persisted state, amount conversion) behind a single enum so
//! callers can match on the variant they care about while still using the
//! `?` operator for easy propagation.

use crate::fixed_point::ConversionError;
use crate::orders::OrderValidationError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BatchSyncError>;

/// Top-level error type returned by all public APIs.
#[derive(Debug, thiserror::Error)]
pub enum BatchSyncError {
    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// An HTTP request to a collaborator failed at the transport level.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading or writing persisted state failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The pinned CA bundle could not be loaded.
    #[error("tls error: {0}")]
    Tls(String),

    /// A collaborator answered with missing or non-numeric fields.
    #[error("malformed response: {0}")]
    MalformedMessage(String),

    /// A collaborator understood the request but refused it.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// An amount could not be converted or quantized.
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// An order failed client-side validation before submission.
    #[error("order rejected: {0}")]
    OrderRejected(#[from] OrderValidationError),

    /// The delegated credential has expired; the user must log in again.
    #[error("credential expired")]
    CredentialExpired,

    /// The same operation is already running for this target.
    #[error("already in progress: {0}")]
    Busy(String),

    /// A user-initiated action has nothing worth doing, e.g. a claim that
    /// would not cover the transfer fee.
    #[error("not eligible: {0}")]
    Ineligible(String),
}
