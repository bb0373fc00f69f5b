//! HMAC-SHA256 request authentication.
//!
//! Mutating facilitator endpoints require `X-Facilitator-Auth: <hex mac>`
//! where the MAC covers the raw request body. Webhook signatures use a key
//! derived from the shared secret with [`derive_key`], so a leaked webhook
//! key cannot authenticate requests.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the request MAC.
pub const AUTH_HEADER: &str = "X-Facilitator-Auth";

/// Label for the webhook signing key.
pub const WEBHOOK_KEY_LABEL: &[u8] = b"x402-webhook-hmac";

fn keyed(secret: &[u8]) -> HmacSha256 {
    // HMAC is defined for keys of every length.
    <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key length")
}

fn mac_bytes(secret: &[u8], body: &[u8]) -> [u8; 32] {
    let mut mac = keyed(secret);
    mac.update(body);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Hex-encoded HMAC-SHA256 of `body`.
pub fn compute_hmac(secret: &[u8], body: &[u8]) -> String {
    alloy::hex::encode(mac_bytes(secret, body))
}

/// Verify a hex MAC in constant time. Malformed hex is compared as zeros
/// so it takes the same path as a wrong MAC.
pub fn verify_hmac(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let mut mac = keyed(secret);
    mac.update(body);
    let provided = alloy::hex::decode(signature.trim()).unwrap_or_else(|_| vec![0u8; 32]);
    mac.verify_slice(&provided).is_ok()
}

/// Derive a purpose-specific key from the shared secret.
pub fn derive_key(secret: &[u8], label: &[u8]) -> Vec<u8> {
    mac_bytes(secret, label).to_vec()
}
