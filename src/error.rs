//! Service-level error taxonomy.
//!
//! Resolution-path failures (self-repair, auto-attach, hydration, absorb) are
//! recovered locally and never surface here; a user must never be blocked
//! from logging in. Billing-path failures (claim, merge commit) are surfaced
//! precisely, because silent failure there causes ownership incorrectness.

use crate::store::StoreError;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced to route handlers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("authentication required")]
    AuthenticationRequired,

    #[error("ownership conflict: {0}")]
    OwnershipConflict(String),

    #[error("phone link required before claiming a subscription")]
    PhoneLinkRequired,

    #[error("app account token is already bound to another user")]
    TokenMismatch,

    #[error("phone seat is already held by another user")]
    EntitlementConflict,

    #[error("entitlement {entitlement_id} is owned by another user")]
    EntitlementOwnedByAnother { entitlement_id: String },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoreError {
    /// HTTP status code the transport layer should map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation(_) => 400,
            CoreError::AuthenticationRequired => 401,
            CoreError::OwnershipConflict(_)
            | CoreError::PhoneLinkRequired
            | CoreError::TokenMismatch => 403,
            CoreError::NotFound { .. } => 404,
            CoreError::EntitlementConflict | CoreError::EntitlementOwnedByAnother { .. } => 409,
            CoreError::Store(_) => 500,
        }
    }
}
