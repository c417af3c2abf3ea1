//! Secret key vault
//!
//! Durable encrypted-at-rest storage for the identity keys, prekey secrets,
//! pinned peer identities and the auth token. Every entry is sealed with
//! AES-256-GCM under the vault key, with the entry name as associated data
//! so sealed values cannot be swapped between names.

use serde::{de::DeserializeOwned, Serialize};
use sqlx::SqlitePool;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::aead;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{IdentityKeyPair, IdentityPublicKey, StoredIdentity, StoredPreKey};
use crate::db;
use crate::error::{AppError, AppResult};

const IDENTITY: &str = "identity";
const AUTH_TOKEN: &str = "auth_token";
const CURRENT_SIGNED_PREKEY: &str = "signed_prekey:current";
const SIGNED_PREKEY_PREFIX: &str = "signed_prekey:";
const ONE_TIME_PREKEY_PREFIX: &str = "otk:";
const NEXT_PREKEY_ID: &str = "next_prekey_id";
const PIN_PREFIX: &str = "pin:";

/// Key sealing vault entries and session blobs
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey([u8; 32]);

impl VaultKey {
    /// Derive a vault key from the user's password or device secret
    pub fn derive(secret: &[u8], salt: &[u8]) -> CryptoResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
        let mut key = [0u8; 32];
        hkdf.expand(b"NoChat Vault Key v1", &mut key)
            .map_err(|e| CryptoError::InvalidKey(format!("Vault key derivation failed: {}", e)))?;
        Ok(Self(key))
    }

    /// Generate a random vault key (for new devices)
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VaultKey(..)")
    }
}

/// Encrypted secret storage backed by the local database
pub struct SecretKeyVault {
    db: SqlitePool,
    key: VaultKey,
}

impl SecretKeyVault {
    pub fn new(db: SqlitePool, key: VaultKey) -> Self {
        Self { db, key }
    }

    /// Seal arbitrary bytes under the vault key
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        aead::seal_combined(&self.key.0, plaintext, aad)
    }

    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> CryptoResult<Vec<u8>> {
        aead::open_combined(&self.key.0, sealed, aad)
    }

    // ========================================================================
    // Generic entries
    // ========================================================================

    pub async fn save(&self, name: &str, plaintext: &[u8]) -> AppResult<()> {
        let sealed = self.seal(plaintext, name.as_bytes())?;
        db::put_vault_entry(&self.db, name, &sealed).await
    }

    pub async fn load(&self, name: &str) -> AppResult<Option<Zeroizing<Vec<u8>>>> {
        match db::get_vault_entry(&self.db, name).await? {
            Some(sealed) => {
                let plaintext = self.open(&sealed, name.as_bytes()).map_err(|e| {
                    AppError::Persistence(format!("Vault entry {} cannot be opened: {}", name, e))
                })?;
                Ok(Some(Zeroizing::new(plaintext)))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, name: &str) -> AppResult<bool> {
        db::delete_vault_entry(&self.db, name).await
    }

    /// Wipe every entry (logout / account deletion)
    pub async fn clear(&self) -> AppResult<()> {
        db::clear_vault(&self.db).await?;
        tracing::info!("Secret vault cleared");
        Ok(())
    }

    async fn save_json<T: Serialize>(&self, name: &str, value: &T) -> AppResult<()> {
        let json = Zeroizing::new(serde_json::to_vec(value)?);
        self.save(name, &json).await
    }

    async fn load_json<T: DeserializeOwned>(&self, name: &str) -> AppResult<Option<T>> {
        match self.load(name).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Identity
    // ========================================================================

    pub async fn save_identity(&self, identity: &IdentityKeyPair) -> AppResult<()> {
        self.save_json(IDENTITY, &identity.to_stored()).await
    }

    pub async fn load_identity(&self) -> AppResult<Option<IdentityKeyPair>> {
        match self.load_json::<StoredIdentity>(IDENTITY).await? {
            Some(stored) => Ok(Some(IdentityKeyPair::from_stored(&stored)?)),
            None => Ok(None),
        }
    }

    pub async fn save_auth_token(&self, token: &str) -> AppResult<()> {
        self.save(AUTH_TOKEN, token.as_bytes()).await
    }

    pub async fn load_auth_token(&self) -> AppResult<Option<String>> {
        match self.load(AUTH_TOKEN).await? {
            Some(bytes) => String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| AppError::Persistence(format!("Auth token is not UTF-8: {}", e))),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Prekeys
    // ========================================================================

    /// Store a signed prekey and make it the current one
    pub async fn save_signed_prekey(&self, prekey: &StoredPreKey) -> AppResult<()> {
        self.save_json(&format!("{}{}", SIGNED_PREKEY_PREFIX, prekey.key_id), prekey)
            .await?;
        self.save_json(CURRENT_SIGNED_PREKEY, &prekey.key_id).await
    }

    pub async fn load_current_signed_prekey(&self) -> AppResult<Option<StoredPreKey>> {
        match self.load_json::<u32>(CURRENT_SIGNED_PREKEY).await? {
            Some(key_id) => self.load_signed_prekey(key_id).await,
            None => Ok(None),
        }
    }

    pub async fn load_signed_prekey(&self, key_id: u32) -> AppResult<Option<StoredPreKey>> {
        self.load_json(&format!("{}{}", SIGNED_PREKEY_PREFIX, key_id)).await
    }

    /// Ids of every retained signed prekey, ascending
    pub async fn signed_prekey_ids(&self) -> AppResult<Vec<u32>> {
        let mut ids: Vec<u32> = db::list_vault_entries(&self.db, SIGNED_PREKEY_PREFIX)
            .await?
            .iter()
            .filter_map(|name| name[SIGNED_PREKEY_PREFIX.len()..].parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn delete_signed_prekey(&self, key_id: u32) -> AppResult<bool> {
        self.delete(&format!("{}{}", SIGNED_PREKEY_PREFIX, key_id)).await
    }

    pub async fn save_one_time_prekeys(&self, prekeys: &[StoredPreKey]) -> AppResult<()> {
        for prekey in prekeys {
            self.save_json(&format!("{}{}", ONE_TIME_PREKEY_PREFIX, prekey.key_id), prekey)
                .await?;
        }
        Ok(())
    }

    pub async fn load_one_time_prekey(&self, key_id: u32) -> AppResult<Option<StoredPreKey>> {
        self.load_json(&format!("{}{}", ONE_TIME_PREKEY_PREFIX, key_id)).await
    }

    /// Delete a one-time prekey (after it's been used)
    pub async fn delete_one_time_prekey(&self, key_id: u32) -> AppResult<bool> {
        self.delete(&format!("{}{}", ONE_TIME_PREKEY_PREFIX, key_id)).await
    }

    pub async fn one_time_prekey_ids(&self) -> AppResult<Vec<u32>> {
        let mut ids: Vec<u32> = db::list_vault_entries(&self.db, ONE_TIME_PREKEY_PREFIX)
            .await?
            .iter()
            .filter_map(|name| name[ONE_TIME_PREKEY_PREFIX.len()..].parse().ok())
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn count_one_time_prekeys(&self) -> AppResult<usize> {
        Ok(db::list_vault_entries(&self.db, ONE_TIME_PREKEY_PREFIX).await?.len())
    }

    pub async fn next_prekey_id(&self) -> AppResult<u32> {
        Ok(self.load_json(NEXT_PREKEY_ID).await?.unwrap_or(1))
    }

    pub async fn set_next_prekey_id(&self, next: u32) -> AppResult<()> {
        self.save_json(NEXT_PREKEY_ID, &next).await
    }

    // ========================================================================
    // Pinned identities
    // ========================================================================

    pub async fn pin_identity(&self, peer_id: &str, identity: &IdentityPublicKey) -> AppResult<()> {
        self.save_json(&format!("{}{}", PIN_PREFIX, peer_id), identity).await
    }

    pub async fn pinned_identity(&self, peer_id: &str) -> AppResult<Option<IdentityPublicKey>> {
        self.load_json(&format!("{}{}", PIN_PREFIX, peer_id)).await
    }
}
