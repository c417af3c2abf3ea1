//! Key types and generation for the Signal Protocol
//!
//! This module defines key types used throughout the session layer:
//! - Identity keys: a Curve25519 key-encapsulation pair plus an Ed25519 signing pair
//! - Curve25519 keys for Diffie-Hellman key exchange and key wrapping
//! - Signed prekeys for medium-term key exchange
//! - One-time prekeys for forward secrecy

use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::errors::{CryptoError, CryptoResult};

fn to_array(bytes: &[u8], what: &str) -> CryptoResult<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey(format!("{} must be 32 bytes", what)))
}

/// Long-term identity of the local user
///
/// Holds two key pairs:
/// - `kem`: Curve25519, used for X3DH and for unwrapping message keys
/// - signing: Ed25519, used to sign prekeys and outbound ciphertexts
pub struct IdentityKeyPair {
    kem: Curve25519KeyPair,
    /// Ed25519 public key (safe to share)
    pub signing_public: Ed25519PublicKey,
    signing_secret: Ed25519SecretKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_secret = Ed25519SecretKey::new();
        let signing_public = signing_secret.public_key();
        Self {
            kem: Curve25519KeyPair::generate(),
            signing_public,
            signing_secret,
        }
    }

    /// Restore from the vault representation
    pub fn from_stored(stored: &StoredIdentity) -> CryptoResult<Self> {
        let kem = Curve25519KeyPair::from_bytes(&stored.kem_public, &stored.kem_secret)?;
        let signing_public =
            Ed25519PublicKey::from_slice(&to_array(&stored.signing_public, "Signing public key")?)?;
        let signing_secret =
            Ed25519SecretKey::from_slice(&to_array(&stored.signing_secret, "Signing secret key")?);

        if signing_secret.public_key().as_bytes() != signing_public.as_bytes() {
            return Err(CryptoError::InvalidKey(
                "Signing secret does not match stored public key".to_string(),
            ));
        }

        Ok(Self {
            kem,
            signing_public,
            signing_secret,
        })
    }

    /// Export for encrypted storage in the vault
    pub fn to_stored(&self) -> StoredIdentity {
        StoredIdentity {
            kem_public: self.kem.public_key_bytes(),
            kem_secret: self.kem.secret_key_bytes(),
            signing_public: self.signing_public.as_bytes().to_vec(),
            signing_secret: self.signing_secret.to_bytes().to_vec(),
        }
    }

    /// Sign a message with the identity signing key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_secret.sign(message).to_bytes().to_vec()
    }

    /// The key-encapsulation key pair
    pub fn kem(&self) -> &Curve25519KeyPair {
        &self.kem
    }

    /// Public half, as published to the server
    pub fn public(&self) -> IdentityPublicKey {
        IdentityPublicKey {
            kem_key: self.kem.public_key_bytes(),
            signing_key: self.signing_public.as_bytes().to_vec(),
        }
    }

    /// Compute a fingerprint for key verification
    pub fn fingerprint(&self) -> String {
        self.public().fingerprint()
    }
}

/// Published half of a user's identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityPublicKey {
    /// Curve25519 key-encapsulation public key
    pub kem_key: Vec<u8>,
    /// Ed25519 signature public key
    pub signing_key: Vec<u8>,
}

impl IdentityPublicKey {
    pub fn kem_public(&self) -> CryptoResult<Curve25519PublicKey> {
        let arr = to_array(&self.kem_key, "Identity KEM key")?;
        Curve25519PublicKey::from_slice(&arr).map_err(Into::into)
    }

    pub fn signing_public(&self) -> CryptoResult<Ed25519PublicKey> {
        let arr = to_array(&self.signing_key, "Identity signing key")?;
        Ed25519PublicKey::from_slice(&arr).map_err(Into::into)
    }

    /// Verify an Ed25519 signature made with this identity
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let signature = vodozemac::Ed25519Signature::from_slice(signature).map_err(|e| {
            CryptoError::SignatureError(format!("Invalid signature format: {:?}", e))
        })?;

        self.signing_public()?
            .verify(message, &signature)
            .map_err(|e| CryptoError::SignatureError(format!("Signature verification failed: {}", e)))
    }

    /// Short hex fingerprint over both public keys
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(&self.kem_key);
        hasher.update(&self.signing_key);
        hex::encode(&hasher.finalize()[..8])
    }
}

/// Identity key material as kept in the vault
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredIdentity {
    pub kem_public: Vec<u8>,
    pub kem_secret: Vec<u8>,
    pub signing_public: Vec<u8>,
    pub signing_secret: Vec<u8>,
}

/// Curve25519 key pair for Diffie-Hellman key exchange
///
/// Used for:
/// - Identity key encapsulation
/// - Ephemeral keys in X3DH and key wrapping
/// - Signed prekeys
/// - One-time prekeys
pub struct Curve25519KeyPair {
    /// Public key (safe to share)
    pub public: Curve25519PublicKey,
    /// Secret key (never leaves device)
    secret: Curve25519SecretKey,
}

impl Curve25519KeyPair {
    /// Generate a new random Curve25519 key pair
    pub fn generate() -> Self {
        let secret = Curve25519SecretKey::new();
        let public = Curve25519PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Restore from existing key bytes
    pub fn from_bytes(public_bytes: &[u8], secret_bytes: &[u8]) -> CryptoResult<Self> {
        let public_arr = to_array(public_bytes, "Public key")?;
        let secret_arr = to_array(secret_bytes, "Secret key")?;

        let public = Curve25519PublicKey::from_slice(&public_arr)?;
        let secret = Curve25519SecretKey::from_slice(&secret_arr);

        if Curve25519PublicKey::from(&secret) != public {
            return Err(CryptoError::InvalidKey(
                "Secret key does not match public key".to_string(),
            ));
        }
        Ok(Self { public, secret })
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &Curve25519PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_bytes().to_vec()
    }

    /// Get the secret key bytes (for secure storage)
    pub fn secret_key_bytes(&self) -> Vec<u8> {
        self.secret.to_bytes().to_vec()
    }
}

/// Signed prekey (rotated periodically, typically every ~7 days)
///
/// A Curve25519 public key with a signature from the identity signing key,
/// proving that the prekey belongs to the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    /// Unique identifier for this prekey
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
    /// Ed25519 signature of the public key
    pub signature: Vec<u8>,
    /// Unix timestamp when this prekey was created
    pub created_at: i64,
}

impl SignedPreKey {
    /// Create a new signed prekey
    pub fn new(key_id: u32, key_pair: &Curve25519KeyPair, identity: &IdentityKeyPair) -> Self {
        Self::with_created_at(key_id, key_pair, identity, chrono::Utc::now().timestamp())
    }

    pub(crate) fn with_created_at(
        key_id: u32,
        key_pair: &Curve25519KeyPair,
        identity: &IdentityKeyPair,
        created_at: i64,
    ) -> Self {
        let public_key = key_pair.public_key_bytes();
        let signature = identity.sign(&public_key);

        Self {
            key_id,
            public_key,
            signature,
            created_at,
        }
    }

    /// Verify the signature with the identity public key
    pub fn verify(&self, identity: &IdentityPublicKey) -> CryptoResult<()> {
        identity.verify(&self.public_key, &self.signature)
    }

    /// Check if this prekey has expired (older than max_age_days)
    pub fn is_expired(&self, max_age_days: i64) -> bool {
        let now = chrono::Utc::now().timestamp();
        let age_seconds = now - self.created_at;
        let max_age_seconds = max_age_days * 24 * 60 * 60;
        age_seconds > max_age_seconds
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<Curve25519PublicKey> {
        let arr = to_array(&self.public_key, "Signed prekey")?;
        Curve25519PublicKey::from_slice(&arr).map_err(Into::into)
    }
}

/// One-time prekey (single use, provides forward secrecy)
///
/// Consumed after a single use to provide forward secrecy for the initial message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKey {
    /// Unique identifier for this prekey
    pub key_id: u32,
    /// The Curve25519 public key
    pub public_key: Vec<u8>,
}

impl OneTimePreKey {
    /// Create a new one-time prekey
    pub fn new(key_id: u32, key_pair: &Curve25519KeyPair) -> Self {
        Self {
            key_id,
            public_key: key_pair.public_key_bytes(),
        }
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> CryptoResult<Curve25519PublicKey> {
        let arr = to_array(&self.public_key, "One-time prekey")?;
        Curve25519PublicKey::from_slice(&arr).map_err(Into::into)
    }
}

/// Stored prekey with secret key (for local storage only)
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct StoredPreKey {
    /// Unique identifier
    pub key_id: u32,
    /// Public key bytes
    pub public_key: Vec<u8>,
    /// Secret key bytes (sealed by the vault before storage)
    pub secret_key: Vec<u8>,
    /// Signature over the public key (signed prekeys only)
    #[serde(default)]
    pub signature: Vec<u8>,
    /// Unix timestamp when the key was created
    #[serde(default)]
    pub created_at: i64,
}

impl StoredPreKey {
    /// Create from a Curve25519 key pair
    pub fn from_keypair(key_id: u32, key_pair: &Curve25519KeyPair) -> Self {
        Self {
            key_id,
            public_key: key_pair.public_key_bytes(),
            secret_key: key_pair.secret_key_bytes(),
            signature: Vec::new(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Create from a signed prekey and its key pair
    pub fn from_signed(signed: &SignedPreKey, key_pair: &Curve25519KeyPair) -> Self {
        Self {
            key_id: signed.key_id,
            public_key: key_pair.public_key_bytes(),
            secret_key: key_pair.secret_key_bytes(),
            signature: signed.signature.clone(),
            created_at: signed.created_at,
        }
    }

    /// Restore the key pair
    pub fn to_keypair(&self) -> CryptoResult<Curve25519KeyPair> {
        Curve25519KeyPair::from_bytes(&self.public_key, &self.secret_key)
    }

    /// Public signed prekey, if this entry is one
    pub fn to_signed(&self) -> SignedPreKey {
        SignedPreKey {
            key_id: self.key_id,
            public_key: self.public_key.clone(),
            signature: self.signature.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_generation() {
        let key = IdentityKeyPair::generate();
        let public = key.public();
        assert_eq!(public.kem_key.len(), 32);
        assert_eq!(public.signing_key.len(), 32);
    }

    #[test]
    fn test_identity_key_signing() {
        let key = IdentityKeyPair::generate();
        let message = b"test message";
        let signature = key.sign(message);
        assert_eq!(signature.len(), 64); // Ed25519 signature is 64 bytes

        assert!(key.public().verify(message, &signature).is_ok());
        assert!(key.public().verify(b"other message", &signature).is_err());
    }

    #[test]
    fn test_identity_stored_roundtrip() {
        let key = IdentityKeyPair::generate();
        let restored = IdentityKeyPair::from_stored(&key.to_stored()).unwrap();
        assert_eq!(key.public(), restored.public());

        let signature = restored.sign(b"hello");
        assert!(key.public().verify(b"hello", &signature).is_ok());
    }

    #[test]
    fn test_identity_rejects_mismatched_halves() {
        let a = IdentityKeyPair::generate().to_stored();
        let b = IdentityKeyPair::generate().to_stored();
        let mixed = StoredIdentity {
            kem_public: a.kem_public.clone(),
            kem_secret: a.kem_secret.clone(),
            signing_public: a.signing_public.clone(),
            signing_secret: b.signing_secret.clone(),
        };
        assert!(IdentityKeyPair::from_stored(&mixed).is_err());
    }

    #[test]
    fn test_diffie_hellman() {
        let alice = Curve25519KeyPair::generate();
        let bob = Curve25519KeyPair::generate();

        let shared_alice = alice.diffie_hellman(&bob.public);
        let shared_bob = bob.diffie_hellman(&alice.public);

        assert_eq!(shared_alice, shared_bob);
    }

    #[test]
    fn test_signed_prekey() {
        let identity = IdentityKeyPair::generate();
        let prekey_pair = Curve25519KeyPair::generate();
        let signed_prekey = SignedPreKey::new(1, &prekey_pair, &identity);

        assert_eq!(signed_prekey.key_id, 1);
        assert!(signed_prekey.verify(&identity.public()).is_ok());

        let other = IdentityKeyPair::generate();
        assert!(signed_prekey.verify(&other.public()).is_err());
    }

    #[test]
    fn test_signed_prekey_expiry() {
        let identity = IdentityKeyPair::generate();
        let prekey_pair = Curve25519KeyPair::generate();
        let mut signed_prekey = SignedPreKey::new(1, &prekey_pair, &identity);

        assert!(!signed_prekey.is_expired(7));

        signed_prekey.created_at = chrono::Utc::now().timestamp() - (8 * 24 * 60 * 60);
        assert!(signed_prekey.is_expired(7));
    }

    #[test]
    fn test_fingerprint() {
        let key = IdentityKeyPair::generate();
        let fingerprint = key.fingerprint();
        assert_eq!(fingerprint.len(), 16); // 8 bytes as hex = 16 chars
        assert_ne!(fingerprint, IdentityKeyPair::generate().fingerprint());
    }
}
