//! Billing webhook signature verification.
//!
//! The billing provider signs each delivery with HMAC-SHA256 over the raw
//! request body and sends the hex digest in the `x-berth-signature` header.
//! Verification recomputes the digest with the shared secret and compares
//! inside the MAC, so the comparison is constant time.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use berth_core::{Error, Result};

use crate::error::ApiError;

/// Header carrying the hex HMAC-SHA256 signature of the raw request body.
pub const SIGNATURE_HEADER: &str = "x-berth-signature";

type HmacSha256 = Hmac<Sha256>;

/// Computes the hex signature a sender attaches in [`SIGNATURE_HEADER`].
///
/// # Errors
///
/// Returns an error if the MAC cannot be initialized.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::internal("failed to initialize hmac"))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies the supplied signature against the raw request body.
///
/// When no secret is configured, verification is skipped with a warning;
/// only acceptable for local development.
///
/// # Errors
///
/// Returns a 401 [`ApiError`] when the signature header is missing,
/// malformed, or does not match the body.
pub fn verify(
    secret: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
    request_id: &str,
) -> std::result::Result<(), ApiError> {
    let Some(secret) = secret else {
        tracing::warn!("webhook signature verification skipped; no signing secret configured");
        return Ok(());
    };

    let supplied = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::invalid_signature().with_request_id(request_id.to_string()))?;

    let supplied = hex::decode(supplied.trim())
        .map_err(|_| ApiError::invalid_signature().with_request_id(request_id.to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        ApiError::internal("failed to initialize hmac").with_request_id(request_id.to_string())
    })?;
    mac.update(body);
    mac.verify_slice(&supplied)
        .map_err(|_| ApiError::invalid_signature().with_request_id(request_id.to_string()))?;

    Ok(())
}
