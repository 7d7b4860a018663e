use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SecurityError};

/// The size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the AES-GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// A secure key wrapper that ensures the key is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecureKey([u8; KEY_SIZE]);

impl SecureKey {
    /// Creates a new `SecureKey` from a 32-byte array.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Returns a reference to the key as a byte slice.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

/// Generates a new random AES-256 key.
pub fn generate_key() -> SecureKey {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SecureKey::new(key)
}

/// Generates a new random AES-GCM nonce.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypts a plaintext using AES-256-GCM.
///
/// Returns the ciphertext and the fresh nonce used for encryption.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<(Vec<u8>, [u8; NONCE_SIZE])> {
    let cipher = Aes256Gcm::new(key.into());

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| SecurityError::Encryption(format!("Encryption failed: {}", e)))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypts a ciphertext using AES-256-GCM.
pub fn decrypt(key: &[u8; KEY_SIZE], ciphertext: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Nonce::from(*nonce);

    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|e| SecurityError::Encryption(format!("Decryption failed: {}", e)))
}

/// Seals a plaintext into a single `ciphertext || nonce` buffer.
///
/// The trailing 12 bytes are the nonce; [`open`] reverses the layout.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let (ciphertext, nonce) = encrypt(key, plaintext)?;

    let mut sealed = Vec::with_capacity(ciphertext.len() + NONCE_SIZE);
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(&nonce);

    Ok(sealed)
}

/// Opens a `ciphertext || nonce` buffer produced by [`seal`].
pub fn open(key: &[u8; KEY_SIZE], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() <= NONCE_SIZE {
        return Err(SecurityError::Encryption(
            "Sealed payload too short".to_string(),
        ));
    }

    let (ciphertext, nonce) = sealed.split_at(sealed.len() - NONCE_SIZE);
    let nonce_arr: [u8; NONCE_SIZE] = nonce
        .try_into()
        .map_err(|_| SecurityError::Encryption("Invalid nonce size".to_string()))?;

    decrypt(key, ciphertext, &nonce_arr)
}

/// Overwrites a buffer with random bytes several passes, then zeroes it.
///
/// This is a mitigation against key material lingering in reusable
/// allocations, not a cryptographic guarantee: copies the allocator or OS
/// already made are out of reach.
pub fn secure_wipe(buf: &mut [u8]) {
    for _ in 0..3 {
        OsRng.fill_bytes(buf);
    }
    buf.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let key = generate_key();
        let plaintext = b"the quick brown fox";

        let (ciphertext, nonce) = encrypt(key.as_bytes(), plaintext).unwrap();
        assert_ne!(&ciphertext, plaintext);

        let decrypted = decrypt(key.as_bytes(), &ciphertext, &nonce).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn seal_open_round_trip() {
        let key = generate_key();
        let sealed = seal(key.as_bytes(), b"key material").unwrap();

        let opened = open(key.as_bytes(), &sealed).unwrap();
        assert_eq!(opened, b"key material");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let key = generate_key();
        let other = generate_key();
        let sealed = seal(key.as_bytes(), b"secret").unwrap();

        assert!(open(other.as_bytes(), &sealed).is_err());
    }

    #[test]
    fn open_rejects_truncated_payload() {
        let key = generate_key();
        assert!(open(key.as_bytes(), &[0u8; NONCE_SIZE]).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = generate_key();
        let mut sealed = seal(key.as_bytes(), b"secret").unwrap();
        sealed[0] ^= 0xff;

        assert!(open(key.as_bytes(), &sealed).is_err());
    }

    #[test]
    fn secure_wipe_zeroes_buffer() {
        let mut buf = vec![0xaau8; 32];
        secure_wipe(&mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
