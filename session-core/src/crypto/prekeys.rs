//! Prekey Bundle Management
//!
//! This module manages the generation, storage, and replenishment of prekeys:
//!
//! - **Signed Prekeys**: Rotated periodically (~7 days), signed by identity key.
//!   The previous signed prekey is retained so handshakes made against it
//!   can still be accepted.
//! - **One-Time Prekeys**: Single-use keys for forward secrecy, replenished on login
//!
//! New secrets are always written to the vault before their public halves
//! are uploaded. Publishing first could leave the server handing out a
//! prekey whose secret was never saved.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::api::ServerApi;
use crate::config::PreKeyConfig;
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey, StoredPreKey};
use crate::crypto::vault::SecretKeyVault;
use crate::error::{AppResult, HandshakeError};
use crate::models::PrekeyUpload;

/// Outcome of a registration or login maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrekeyReport {
    /// One-time prekeys the server reported before maintenance
    pub server_count: usize,
    /// Newly generated one-time prekeys
    pub generated: usize,
    /// The server pool was replaced because local secrets were missing
    pub replaced: bool,
    /// A new signed prekey was generated and published
    pub rotated_signed_prekey: bool,
}

/// Status of prekey availability
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyStatus {
    /// Number of one-time prekey secrets held locally
    pub one_time_prekey_count: usize,
    /// Current signed prekey id
    pub signed_prekey_id: Option<u32>,
    /// Whether signed prekey rotation is needed
    pub needs_rotation: bool,
    /// Age of signed prekey in seconds
    pub signed_prekey_age_seconds: i64,
}

/// Manages prekey generation and lifecycle
pub struct PrekeyLifecycleManager {
    vault: Arc<SecretKeyVault>,
    api: Arc<dyn ServerApi>,
    config: PreKeyConfig,
    /// Serializes maintenance passes so two logins never allocate the same ids
    maintenance: Mutex<()>,
}

impl PrekeyLifecycleManager {
    pub fn new(vault: Arc<SecretKeyVault>, api: Arc<dyn ServerApi>, config: PreKeyConfig) -> Self {
        Self {
            vault,
            api,
            config,
            maintenance: Mutex::new(()),
        }
    }

    /// Publish identity and a full prekey set for a newly created identity
    pub async fn register(&self, identity: &IdentityKeyPair) -> AppResult<PrekeyReport> {
        let _guard = self.maintenance.lock().await;

        let signed = self.create_signed_prekey(identity).await?;
        let one_time = self.generate_one_time_prekeys(self.config.target_pool_size).await?;

        self.api.publish_identity(&identity.public()).await?;
        self.api
            .upload_prekeys(&PrekeyUpload {
                signed_prekey: Some(signed),
                one_time_prekeys: one_time,
                replace: true,
            })
            .await?;

        tracing::info!(
            "Registered identity {} with {} one-time prekeys",
            identity.fingerprint(),
            self.config.target_pool_size
        );

        Ok(PrekeyReport {
            server_count: 0,
            generated: self.config.target_pool_size,
            replaced: true,
            rotated_signed_prekey: true,
        })
    }

    /// Login maintenance: rotate a stale signed prekey and refill the pool
    pub async fn on_login(&self, identity: &IdentityKeyPair) -> AppResult<PrekeyReport> {
        let _guard = self.maintenance.lock().await;
        let mut report = PrekeyReport::default();

        let signed_upload = match self.vault.load_current_signed_prekey().await? {
            Some(current) if !current.to_signed().is_expired(self.config.signed_prekey_max_age_days) => None,
            Some(_) => {
                tracing::info!("Signed prekey is older than {} days, rotating", self.config.signed_prekey_max_age_days);
                Some(self.create_signed_prekey(identity).await?)
            }
            None => {
                tracing::warn!("No signed prekey secret held locally, generating a new one");
                Some(self.create_signed_prekey(identity).await?)
            }
        };
        report.rotated_signed_prekey = signed_upload.is_some();

        report.server_count = self.api.get_prekey_count().await?;
        let local_count = self.vault.count_one_time_prekeys().await?;

        let (one_time, replace) = if local_count < report.server_count {
            // The server advertises prekeys we cannot answer; publish a fresh
            // pool in their place. Secrets still held stay, since a peer may
            // have fetched a bundle referencing one before the replacement.
            tracing::warn!(
                "Server holds {} one-time prekeys but only {} secrets are local; replacing the pool",
                report.server_count,
                local_count
            );
            (self.generate_one_time_prekeys(self.config.target_pool_size).await?, true)
        } else if report.server_count < self.config.low_water_mark {
            let count = self.config.target_pool_size.saturating_sub(report.server_count);
            tracing::info!(
                "One-time prekeys below low-water mark ({} < {}), generating {}",
                report.server_count,
                self.config.low_water_mark,
                count
            );
            (self.generate_one_time_prekeys(count).await?, false)
        } else {
            (Vec::new(), false)
        };

        report.generated = one_time.len();
        report.replaced = replace;

        if signed_upload.is_some() || !one_time.is_empty() {
            self.api
                .upload_prekeys(&PrekeyUpload {
                    signed_prekey: signed_upload,
                    one_time_prekeys: one_time,
                    replace,
                })
                .await?;
        }

        Ok(report)
    }

    /// Generate, persist, and return a new current signed prekey.
    ///
    /// Only the previous signed prekey is kept besides the new one.
    async fn create_signed_prekey(&self, identity: &IdentityKeyPair) -> AppResult<SignedPreKey> {
        let existing = self.vault.signed_prekey_ids().await?;
        let key_id = existing.last().map_or(1, |id| id + 1);

        let key_pair = Curve25519KeyPair::generate();
        let signed = SignedPreKey::new(key_id, &key_pair, identity);
        self.vault
            .save_signed_prekey(&StoredPreKey::from_signed(&signed, &key_pair))
            .await?;

        // Keep the previous one for late handshakes
        let stale = existing.len().saturating_sub(1);
        for old_id in existing.into_iter().take(stale) {
            self.vault.delete_signed_prekey(old_id).await?;
        }

        Ok(signed)
    }

    /// Generate `count` one-time prekeys and persist their secrets
    async fn generate_one_time_prekeys(&self, count: usize) -> AppResult<Vec<OneTimePreKey>> {
        let start_id = self.vault.next_prekey_id().await?;

        let mut stored = Vec::with_capacity(count);
        let mut public = Vec::with_capacity(count);
        for i in 0..count {
            let key_id = start_id + i as u32;
            let key_pair = Curve25519KeyPair::generate();
            public.push(OneTimePreKey::new(key_id, &key_pair));
            stored.push(StoredPreKey::from_keypair(key_id, &key_pair));
        }

        self.vault.save_one_time_prekeys(&stored).await?;
        self.vault.set_next_prekey_id(start_id + count as u32).await?;
        Ok(public)
    }

    /// Secret half of a signed prekey referenced by a peer's handshake
    pub async fn signed_prekey_pair(&self, key_id: u32) -> AppResult<Curve25519KeyPair> {
        match self.vault.load_signed_prekey(key_id).await? {
            Some(stored) => Ok(stored.to_keypair()?),
            None => Err(HandshakeError::UnknownPrekey(key_id).into()),
        }
    }

    /// Secret half of a one-time prekey; does not consume it
    pub async fn one_time_prekey_pair(&self, key_id: u32) -> AppResult<Curve25519KeyPair> {
        match self.vault.load_one_time_prekey(key_id).await? {
            Some(stored) => Ok(stored.to_keypair()?),
            None => Err(HandshakeError::UnknownPrekey(key_id).into()),
        }
    }

    /// Remove a one-time prekey secret once its session has been persisted
    pub async fn consume_one_time_prekey(&self, key_id: u32) -> AppResult<()> {
        if !self.vault.delete_one_time_prekey(key_id).await? {
            tracing::warn!("One-time prekey {} was already consumed", key_id);
        }
        Ok(())
    }

    /// Get the current status of prekeys
    pub async fn status(&self) -> AppResult<PreKeyStatus> {
        let current = self.vault.load_current_signed_prekey().await?;
        let now = chrono::Utc::now().timestamp();

        Ok(PreKeyStatus {
            one_time_prekey_count: self.vault.count_one_time_prekeys().await?,
            signed_prekey_id: current.as_ref().map(|p| p.key_id),
            needs_rotation: current
                .as_ref()
                .map_or(true, |p| p.to_signed().is_expired(self.config.signed_prekey_max_age_days)),
            signed_prekey_age_seconds: current.as_ref().map_or(0, |p| now - p.created_at),
        })
    }
}
