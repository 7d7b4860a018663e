use argon2::Argon2;
use rand::{RngCore, rngs::OsRng};
use zeroize::Zeroizing;

use crate::crypto::aes;
use crate::error::{Result, SecurityError};

/// The size of the key-derivation salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Derives a 32-byte key from a password and salt using Argon2.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; aes::KEY_SIZE]> {
    let mut key = [0u8; aes::KEY_SIZE];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| SecurityError::Encryption(format!("Argon2 key derivation error: {}", e)))?;
    Ok(key)
}

/// Seals a plaintext under a password-derived key.
///
/// Returns the sealed payload and the random salt used for derivation. The
/// salt must be kept alongside the payload for [`open_with_password`].
pub fn seal_with_password(password: &str, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);

    let key = Zeroizing::new(derive_key(password, &salt)?);
    let sealed = aes::seal(&key, plaintext)?;

    Ok((sealed, salt.to_vec()))
}

/// Opens a payload sealed by [`seal_with_password`].
pub fn open_with_password(password: &str, salt: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
    let key = Zeroizing::new(derive_key(password, salt)?);
    aes::open(&key, sealed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_seal_round_trip() {
        let (sealed, salt) = seal_with_password("correct horse", b"payload").unwrap();
        let opened = open_with_password("correct horse", &salt, &sealed).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn wrong_password_fails() {
        let (sealed, salt) = seal_with_password("correct horse", b"payload").unwrap();
        assert!(open_with_password("battery staple", &salt, &sealed).is_err());
    }

    #[test]
    fn derivation_is_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let a = derive_key("pw", &salt).unwrap();
        let b = derive_key("pw", &salt).unwrap();
        assert_eq!(a, b);
    }
}
