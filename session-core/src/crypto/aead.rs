//! AES-256-GCM helpers shared by the ratchet, sender chains, key wrapping
//! and the vault.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use crate::crypto::errors::{CryptoError, CryptoResult};

pub const NONCE_LEN: usize = 12;

fn cipher(key: &[u8; 32]) -> CryptoResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

/// Encrypt with a fresh random nonce. Returns `(nonce, ciphertext)`.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> CryptoResult<([u8; NONCE_LEN], Vec<u8>)> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionError("AES-GCM encryption failed".to_string()))?;

    Ok((nonce, ciphertext))
}

pub fn open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionError(format!(
            "Nonce must be {} bytes",
            NONCE_LEN
        )));
    }

    let plaintext = cipher(key)?.decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })?;
    Ok(plaintext)
}

/// Encrypt and return `nonce || ciphertext` as one buffer.
pub fn seal_combined(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
    let (nonce, ciphertext) = seal(key, plaintext, aad)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open_combined(key: &[u8; 32], data: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::DecryptionError("Ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    open(key, nonce, ciphertext, aad)
}
