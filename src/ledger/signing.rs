use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the relay signature.
pub const SIGNATURE_HEADER: &str = "X-Relay-Signature";
/// Header carrying the millisecond timestamp covered by the signature.
pub const TIMESTAMP_HEADER: &str = "X-Relay-Timestamp";

/// HMAC-SHA256 over `"<timestamp>.<body>"`, hex encoded.
pub fn sign_relay_request(timestamp_ms: u64, body: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("HMAC error: {}", e))?;
    mac.update(timestamp_ms.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
