//! Request authentication.
//!
//! Operator routes carry `Authorization: Bearer <gateway.auth.token>`.
//! Producer callbacks are signed instead: `X-Sitevault-Signature: sha256=<hex>`
//! over the raw body, keyed by the site's access credential.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sitevault_core::VaultError;

use crate::app::AppState;
use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-sitevault-signature";

/// Middleware for operator routes. With no token configured the gate is open.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.config.gateway.auth.token.as_deref() {
        verify_bearer_token(req.headers(), expected)?;
    }
    Ok(next.run(req).await)
}

/// Verify a static bearer token in the `Authorization: Bearer <token>` header.
pub fn verify_bearer_token(headers: &HeaderMap, expected: &str) -> Result<(), VaultError> {
    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| VaultError::AuthFailed("missing Authorization header".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or_else(|| {
            VaultError::AuthFailed("Authorization header must use Bearer scheme".into())
        })?;

    if token == expected {
        Ok(())
    } else {
        Err(VaultError::AuthFailed("bearer token mismatch".into()))
    }
}

/// Verify `sha256=<hex>` in [`SIGNATURE_HEADER`] against `body` keyed by `secret`.
pub fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> Result<(), VaultError> {
    let sig_header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| VaultError::AuthFailed("missing X-Sitevault-Signature header".into()))?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| VaultError::AuthFailed("malformed X-Sitevault-Signature header".into()))?;

    let expected = hex::decode(sig_hex)
        .map_err(|_| VaultError::AuthFailed("X-Sitevault-Signature is not valid hex".into()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VaultError::Internal("invalid HMAC key length".into()))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| VaultError::AuthFailed("HMAC signature mismatch".into()))
}

/// Header value a producer must send for `body`.
pub fn sign(body: &[u8], secret: &str) -> Result<String, VaultError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| VaultError::Internal("invalid HMAC key length".into()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
