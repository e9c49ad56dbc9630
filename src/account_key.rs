//! Deterministic account key derivation.
//!
//! Two devices presenting the same verified phone number must converge on the
//! same account id before any index row exists, so the id is a pure function
//! of the normalized phone number. No coordination, no allocation.

use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Derive the canonical account id for a verified E.164 phone number.
///
/// Normalizes (trims) the input and returns the lowercase hex SHA-256 digest.
/// Fails with [`CoreError::Validation`] when the phone string is empty;
/// pure and total otherwise.
pub fn account_id_from_phone(phone_e164: &str) -> Result<String, CoreError> {
    let normalized = phone_e164.trim();
    if normalized.is_empty() {
        return Err(CoreError::Validation("phone number cannot be empty".into()));
    }
    let digest = Sha256::digest(normalized.as_bytes());
    Ok(hex::encode(digest))
}
