//! Secret comparison helpers.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Compare two secrets without leaking content or length through timing:
/// both sides are hashed to fixed-size digests before the `subtle` compare.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    Sha256::digest(a).ct_eq(&Sha256::digest(b)).into()
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let token = header.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Check an `Authorization` header against the expected bearer token.
pub fn bearer_matches(header: Option<&str>, expected: &[u8]) -> bool {
    header
        .and_then(bearer_token)
        .is_some_and(|t| constant_time_eq(t.as_bytes(), expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compares_content_and_length() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"tokem"));
        assert!(!constant_time_eq(b"short", b"much longer token"));
    }

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn bearer_match() {
        assert!(bearer_matches(Some("Bearer s3cret"), b"s3cret"));
        assert!(!bearer_matches(Some("Bearer wrong"), b"s3cret"));
        assert!(!bearer_matches(None, b"s3cret"));
    }
}
