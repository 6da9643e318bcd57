//! Request signing for the upstream chat endpoint.
//!
//! Double HMAC-SHA256: the inner pass keys a fixed secret over the 5-minute
//! time window, the outer pass keys the inner hex digest over the request
//! info, base64 of the latest user content, and the timestamp. Both digests
//! are hex-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNING_KEY: &[u8] = b"key-@@@@)))()((9))-xxxx&&&%%%%%";
const WINDOW_MS: i64 = 5 * 60 * 1000;

fn hmac_sha256_hex(key: &[u8], data: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn generate_signature(
    user_id: &str,
    request_id: &str,
    user_content: &str,
    timestamp_ms: i64,
) -> String {
    let request_info = format!(
        "requestId,{},timestamp,{},user_id,{}",
        request_id, timestamp_ms, user_id
    );
    let content_b64 = STANDARD.encode(user_content.as_bytes());
    let sign_data = format!("{}|{}|{}", request_info, content_b64, timestamp_ms);

    let period = timestamp_ms / WINDOW_MS;
    let inner = hmac_sha256_hex(SIGNING_KEY, &period.to_string());
    hmac_sha256_hex(inner.as_bytes(), &sign_data)
}
