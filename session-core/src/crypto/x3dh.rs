//! X3DH key agreement between an initiator and a published prekey bundle
//!
//! The initiator mixes four Diffie-Hellman outputs (three without a
//! one-time prekey) into the session root secret and ships its ephemeral
//! key in a [`KeyExchangeBundle`]. The responder recomputes the same secret
//! from its stored prekey secrets when it accepts the exchange.
//!
//! Identity keys carry a dedicated Curve25519 half, so no Ed25519 to
//! Montgomery conversion is needed.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use vodozemac::Curve25519PublicKey;
use zeroize::Zeroize;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{
    Curve25519KeyPair, IdentityKeyPair, IdentityPublicKey, OneTimePreKey, SignedPreKey,
};

/// Result of X3DH key agreement (initiator side)
pub struct X3dhResult {
    /// The derived shared secret (32 bytes)
    pub shared_secret: [u8; 32],
    /// The ephemeral public key to send to the responder
    pub ephemeral_public: Vec<u8>,
    /// The ID of the signed prekey that was used
    pub signed_prekey_id: u32,
    /// The ID of the one-time prekey that was used (if any)
    pub used_one_time_prekey: Option<u32>,
}

impl Drop for X3dhResult {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

/// Prekey bundle fetched from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreKeyBundle {
    /// The responder's identity public key
    pub identity_key: IdentityPublicKey,
    /// The responder's signed prekey
    pub signed_prekey: SignedPreKey,
    /// Optional one-time prekey (consumed after use)
    pub one_time_prekey: Option<OneTimePreKey>,
}

impl PreKeyBundle {
    /// Check that every key in the bundle parses
    pub fn validate_keys(&self) -> CryptoResult<()> {
        self.identity_key.kem_public()?;
        self.identity_key.signing_public()?;
        self.signed_prekey.get_public_key()?;
        if let Some(otk) = &self.one_time_prekey {
            otk.get_public_key()?;
        }
        Ok(())
    }

    /// Verify that the signed prekey has a valid signature from the identity key
    pub fn verify(&self) -> CryptoResult<()> {
        self.signed_prekey.verify(&self.identity_key)
    }
}

/// Information sent from initiator to responder to bootstrap the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeBundle {
    /// Initiator's identity public key
    pub identity_key: IdentityPublicKey,
    /// Initiator's ephemeral public key
    pub ephemeral_key: Vec<u8>,
    /// ID of the signed prekey that was used
    pub signed_prekey_id: u32,
    /// ID of the one-time prekey that was used (if any)
    pub one_time_prekey_id: Option<u32>,
}

impl KeyExchangeBundle {
    pub fn ephemeral_public(&self) -> CryptoResult<Curve25519PublicKey> {
        let arr: [u8; 32] = self.ephemeral_key.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKey("Ephemeral key must be 32 bytes".to_string())
        })?;
        Curve25519PublicKey::from_slice(&arr).map_err(Into::into)
    }
}

/// Perform X3DH key agreement (initiator/Alice side)
///
/// Verifies the bundle, generates an ephemeral key pair and derives a
/// shared secret using the responder's prekeys.
pub fn x3dh_initiate(
    our_identity: &IdentityKeyPair,
    their_bundle: &PreKeyBundle,
) -> CryptoResult<X3dhResult> {
    their_bundle.verify()?;

    let ephemeral = Curve25519KeyPair::generate();

    let their_identity = their_bundle.identity_key.kem_public()?;
    let their_signed_prekey = their_bundle.signed_prekey.get_public_key()?;

    // DH1 = DH(IK_A, SPK_B)
    let dh1 = our_identity.kem().diffie_hellman(&their_signed_prekey);

    // DH2 = DH(EK_A, IK_B)
    let dh2 = ephemeral.diffie_hellman(&their_identity);

    // DH3 = DH(EK_A, SPK_B)
    let dh3 = ephemeral.diffie_hellman(&their_signed_prekey);

    // DH4 = DH(EK_A, OPK_B) if one-time prekey exists
    let (dh4, used_otk_id) = match their_bundle.one_time_prekey {
        Some(ref otk) => {
            let their_otk = otk.get_public_key()?;
            (Some(ephemeral.diffie_hellman(&their_otk)), Some(otk.key_id))
        }
        None => (None, None),
    };

    let shared_secret = kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref())?;

    Ok(X3dhResult {
        shared_secret,
        ephemeral_public: ephemeral.public_key_bytes(),
        signed_prekey_id: their_bundle.signed_prekey.key_id,
        used_one_time_prekey: used_otk_id,
    })
}

/// Perform X3DH key agreement (responder/Bob side)
///
/// Uses our prekeys to derive the same shared secret the initiator computed.
pub fn x3dh_respond(
    our_identity: &IdentityKeyPair,
    our_signed_prekey: &Curve25519KeyPair,
    our_one_time_prekey: Option<&Curve25519KeyPair>,
    their_identity: &IdentityPublicKey,
    their_ephemeral: &Curve25519PublicKey,
) -> CryptoResult<[u8; 32]> {
    let their_identity = their_identity.kem_public()?;

    // DH1 = DH(SPK_B, IK_A)
    let dh1 = our_signed_prekey.diffie_hellman(&their_identity);

    // DH2 = DH(IK_B, EK_A)
    let dh2 = our_identity.kem().diffie_hellman(their_ephemeral);

    // DH3 = DH(SPK_B, EK_A)
    let dh3 = our_signed_prekey.diffie_hellman(their_ephemeral);

    // DH4 = DH(OPK_B, EK_A) if one-time prekey was used
    let dh4 = our_one_time_prekey.map(|otk| otk.diffie_hellman(their_ephemeral));

    kdf_x3dh(&dh1, &dh2, &dh3, dh4.as_ref())
}

/// KDF for combining X3DH DH outputs into a shared secret
///
/// Uses HKDF-SHA256 with a fixed info string to derive the final shared secret.
fn kdf_x3dh(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> CryptoResult<[u8; 32]> {
    let mut input = Vec::with_capacity(if dh4.is_some() { 160 } else { 128 });

    // 32 bytes of 0xFF, the X3DH domain separator
    input.extend_from_slice(&[0xFF; 32]);
    input.extend_from_slice(dh1);
    input.extend_from_slice(dh2);
    input.extend_from_slice(dh3);

    if let Some(dh4_bytes) = dh4 {
        input.extend_from_slice(dh4_bytes);
    }

    let hkdf = Hkdf::<Sha256>::new(None, &input);
    input.zeroize();

    let mut output = [0u8; 32];
    hkdf.expand(b"NoChat X3DH v1", &mut output)
        .map_err(|e| CryptoError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;

    Ok(output)
}
