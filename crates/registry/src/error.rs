//! Registry error types and result alias.
//!
//! This module defines the error taxonomy for configuration record
//! operations. Store implementations must map their internal errors to these
//! standardized types so callers can branch on kind rather than message text.
//!
//! # Error Types
//!
//! - [`RegistryError::Validation`] - Malformed input, caller-fixable
//! - [`RegistryError::NotFound`] - No record with the given id
//! - [`RegistryError::Duplicate`] - Id collision on insert
//! - [`RegistryError::Conflict`] - Stale sequence on update (or missing record)
//! - [`RegistryError::Permission`] - Requester denied (IP allow-list)
//! - [`RegistryError::Aborted`] - Cancelled long-running operation
//! - [`RegistryError::Store`] - Backing-store or transient failures
//! - [`RegistryError::Internal`] - Everything that should not happen
//!
//! # Example
//!
//! ```
//! use servicekit_registry::{RegistryError, RegistryResult};
//!
//! fn lookup(id: &str) -> RegistryResult<Vec<u8>> {
//!     Err(RegistryError::not_found(id))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A shared error type for source chain tracking.
///
/// `Arc` rather than `Box` so errors can be cloned through the memoizing
/// record cache, where one failed fetch is observed by every coalesced
/// caller.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur during configuration record operations.
///
/// Errors preserve their source chain via the `#[source]` attribute, and each
/// variant maps to a stable machine-readable [`code`](Self::code) and an HTTP
/// [`status`](Self::http_status) for boundary layers.
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]` — new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// The input failed validation before reaching the store.
    #[error("{message}")]
    Validation {
        /// Description of what was malformed.
        message: String,
    },

    /// No configuration record exists with the given id.
    #[error("Configuration not found: {id}")]
    NotFound {
        /// The id that was not found.
        id: String,
    },

    /// A record with this id already exists.
    #[error("Duplicate configuration: {id}")]
    Duplicate {
        /// The colliding id.
        id: String,
    },

    /// Conditional update failed.
    ///
    /// Covers both a stale sequence and a missing record with a single
    /// variant: distinguishing the two would let callers probe for record
    /// existence through the update path.
    #[error(
        "Could not update configuration. Record sequence does not match \
         or configuration does not exist."
    )]
    Conflict,

    /// The requester is not permitted to read the record.
    #[error("{message}")]
    Permission {
        /// Public denial message.
        message: String,
    },

    /// A cooperative cancellation signal fired mid-operation.
    #[error("Operation aborted")]
    Aborted,

    /// Backing-store failure (connection, timeout, corrupt data).
    ///
    /// Treated as transient by the refresher and usage paths.
    #[error("Store error: {message}")]
    Store {
        /// Description of the store failure.
        message: String,
        /// The underlying error, when one exists.
        #[source]
        source: Option<BoxError>,
    },

    /// Internal invariant violation.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal failure.
        message: String,
        /// The underlying error, when one exists.
        #[source]
        source: Option<BoxError>,
    },
}

impl RegistryError {
    /// Creates a new `Validation` error with the given message.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a new `NotFound` error for the given record id.
    #[must_use]
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Creates a new `Duplicate` error for the given record id.
    #[must_use]
    pub fn duplicate(id: impl Into<String>) -> Self {
        Self::Duplicate { id: id.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Permission` error with the given message.
    #[must_use]
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission { message: message.into() }
    }

    /// Creates the `Permission` error raised when no source address matches
    /// the record's IP allow-list.
    #[must_use]
    pub fn ip_not_allowed() -> Self {
        Self::Permission { message: "Permission denied. Source IP is not allowed.".into() }
    }

    /// Creates a new `Aborted` error.
    #[must_use]
    pub fn aborted() -> Self {
        Self::Aborted
    }

    /// Creates a new `Store` error with the given message.
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into(), source: None }
    }

    /// Creates a new `Store` error with a message and source error.
    #[must_use]
    pub fn store_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Stable machine-readable code for this error kind.
    ///
    /// Boundary layers put this in response bodies; it never changes for a
    /// given variant even when the display message does.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::NotFound { .. } => "not_found",
            Self::Duplicate { .. } => "duplicate",
            Self::Conflict => "conflict",
            Self::Permission { .. } => "permission",
            Self::Aborted => "aborted",
            Self::Store { .. } => "store",
            Self::Internal { .. } => "internal",
        }
    }

    /// HTTP status code boundary layers should map this error to.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Duplicate { .. } | Self::Conflict => 409,
            Self::Permission { .. } => 403,
            Self::Aborted => 499,
            Self::Store { .. } | Self::Internal { .. } => 500,
        }
    }

    /// Whether retrying the same call may succeed without caller changes.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::Aborted)
    }
}
