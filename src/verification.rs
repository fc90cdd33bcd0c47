//! HMAC-SHA256 verification of inbound webhook bodies.
//!
//! The signature header may carry the digest as `sha256=<hex>`, as bare hex,
//! or as standard base64. Every failure mode collapses to `false`.

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const DIGEST_LEN: usize = 32;

/// Decode a signature header into raw digest bytes.
///
/// Returns `None` for anything that is not a 32-byte SHA-256 digest.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let value = header.trim();
    if value.is_empty() {
        return None;
    }

    if let Some(hex_sig) = value.strip_prefix("sha256=") {
        return hex::decode(hex_sig).ok().filter(|b| b.len() == DIGEST_LEN);
    }

    // An algorithm prefix other than sha256 is never accepted.
    if value.contains('=') && !value.ends_with('=') {
        return None;
    }

    if let Ok(bytes) = hex::decode(value) {
        if bytes.len() == DIGEST_LEN {
            return Some(bytes);
        }
    }

    base64::engine::general_purpose::STANDARD
        .decode(value)
        .ok()
        .filter(|b| b.len() == DIGEST_LEN)
}

/// Compute the raw HMAC-SHA256 of `payload`. Used by senders and tests.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        // HMAC accepts keys of any length.
        Err(_) => return Vec::new(),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Format a digest the way senders put it on the wire: `sha256=<hex>`.
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Verify `signature_header` against the raw body using `secret`.
///
/// Constant-time comparison via `Mac::verify_slice`. An empty secret is
/// treated as missing and never verifies.
pub fn verify(raw_body: &[u8], signature_header: &str, secret: &[u8]) -> bool {
    if secret.is_empty() {
        return false;
    }

    let expected = match parse_signature_header(signature_header) {
        Some(sig) => sig,
        None => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(raw_body);
    mac.verify_slice(&expected).is_ok()
}

/// Verify against any of the active secrets. Lets per-subscription secrets
/// and a rotated shared secret coexist.
pub fn verify_any<S: AsRef<[u8]>>(raw_body: &[u8], signature_header: &str, secrets: &[S]) -> bool {
    secrets
        .iter()
        .any(|secret| verify(raw_body, signature_header, secret.as_ref()))
}
