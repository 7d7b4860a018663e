use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Result, SecurityError};

type HmacSha256 = Hmac<Sha256>;

/// Computes an HMAC-SHA256 tag over `data`.
pub fn sign(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| SecurityError::Encryption(format!("HMAC key error: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verifies an HMAC-SHA256 tag in constant time.
pub fn verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<bool> {
    let expected = sign(key, data)?;
    Ok(ct_eq(&expected, tag))
}

/// Hex-encoded SHA-256 digest. Session fingerprints are built on this.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Constant-time equality over byte strings.
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let tag = sign(b"key", b"message").unwrap();
        assert!(verify(b"key", b"message", &tag).unwrap());
    }

    #[test]
    fn tampered_message_fails() {
        let tag = sign(b"key", b"message").unwrap();
        assert!(!verify(b"key", b"messagE", &tag).unwrap());
        assert!(!verify(b"other key", b"message", &tag).unwrap());
    }

    #[test]
    fn digest_is_stable() {
        assert_eq!(sha256_hex(b"abc"), sha256_hex(b"abc"));
        assert_ne!(sha256_hex(b"abc"), sha256_hex(b"abd"));
    }

    #[test]
    fn ct_eq_handles_length_mismatch() {
        assert!(!ct_eq(b"abc", b"abcd"));
        assert!(ct_eq(b"abc", b"abc"));
    }
}
