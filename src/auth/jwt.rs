//! Claims extraction from upstream credentials.
//!
//! Credentials are usually JWTs but the upstream never asks us to verify
//! them; only the payload claims are of interest. No signature check.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
}

/// Decode the payload segment of a JWT without verifying the signature.
/// Returns `None` for anything that does not look like a JWT.
pub fn decode_payload(token: &str) -> Option<Claims> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;

    let mut padded = payload.to_string();
    let rem = padded.len() % 4;
    if rem != 0 {
        padded.push_str(&"=".repeat(4 - rem));
    }

    let decoded = URL_SAFE
        .decode(&padded)
        .or_else(|_| URL_SAFE_NO_PAD.decode(payload))
        .ok()?;

    serde_json::from_slice(&decoded).ok()
}
