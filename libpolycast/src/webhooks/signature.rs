//! Webhook signature verification (HMAC-SHA256)
//!
//! Every supported platform signs the raw request body with a shared secret
//! and sends the hex digest in a header, behind a platform-specific prefix:
//!
//! | Platform        | Header                | Value               |
//! |-----------------|-----------------------|---------------------|
//! | Meta            | `X-Hub-Signature-256` | `sha256=<hex>`      |
//! | LinkedIn        | `X-LI-Signature`      | `hmacsha256=<hex>`  |
//! | Google Business | `X-Goog-Signature`    | `sha256=<hex>`      |
//!
//! Verification runs before the body is parsed.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::types::Platform;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature, lowercase as axum normalizes it
pub fn signature_header(platform: Platform) -> &'static str {
    match platform {
        Platform::Meta => "x-hub-signature-256",
        Platform::LinkedIn => "x-li-signature",
        Platform::GoogleBusiness => "x-goog-signature",
    }
}

fn signature_prefix(platform: Platform) -> &'static str {
    match platform {
        Platform::LinkedIn => "hmacsha256=",
        Platform::Meta | Platform::GoogleBusiness => "sha256=",
    }
}

/// Decode a signature header value into raw digest bytes.
///
/// Returns `None` for a missing prefix or bad hex. The prefix match is
/// case-insensitive.
pub fn parse_signature_header(platform: Platform, header: &str) -> Option<Vec<u8>> {
    let prefix = signature_prefix(platform);
    let header = header.trim();
    let (head, digest) = (header.get(..prefix.len())?, header.get(prefix.len()..)?);
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    hex::decode(digest).ok()
}

/// HMAC-SHA256 of `payload` under `secret`
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Header value the platform would send for `signature`
pub fn format_signature_header(platform: Platform, signature: &[u8]) -> String {
    format!("{}{}", signature_prefix(platform), hex::encode(signature))
}

/// Constant-time check of `signature_header` against `payload` and `secret`
pub fn verify_signature(
    platform: Platform,
    payload: &[u8],
    signature_header: &str,
    secret: &[u8],
) -> bool {
    let Some(expected) = parse_signature_header(platform, signature_header) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}
