//! Narrow contract over the cryptographic primitives
//!
//! The session layer never touches key-agreement or cipher internals
//! directly; it calls through `RatchetPrimitives`. `StandardPrimitives`
//! is the production implementation built on the X3DH, ratchet and
//! sender-chain modules.

use hkdf::Hkdf;
use sha2::Sha256;
use vodozemac::Curve25519PublicKey;
use zeroize::Zeroize;

use crate::crypto::aead;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::group::{self, GroupEncryptOutput, SenderChainState};
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair, IdentityPublicKey};
use crate::crypto::ratchet::{MessageKey, RatchetMessage, RatchetRole, RatchetState};
use crate::crypto::x3dh::{x3dh_initiate, x3dh_respond, KeyExchangeBundle, PreKeyBundle};

/// New session state plus the bundle to transmit to the peer
pub struct InitialSession {
    pub state: RatchetState,
    pub bundle: KeyExchangeBundle,
}

/// Output of one pairwise ratchet step
pub struct RatchetEncryptOutput {
    pub message: RatchetMessage,
    pub new_state: RatchetState,
    pub message_key: MessageKey,
}

pub trait RatchetPrimitives: Send + Sync {
    /// Wrap `plaintext` so only the holder of `recipient`'s KEM secret can read it
    fn encrypt_for_recipient(
        &self,
        recipient: &IdentityPublicKey,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>>;

    fn decrypt_from_sender(&self, me: &IdentityKeyPair, wrapped: &[u8]) -> CryptoResult<Vec<u8>>;

    fn sign(&self, me: &IdentityKeyPair, bytes: &[u8]) -> Vec<u8>;

    fn verify(&self, signer: &IdentityPublicKey, bytes: &[u8], signature: &[u8]) -> bool;

    fn create_initial_ratchet_session(
        &self,
        me: &IdentityKeyPair,
        peer_bundle: &PreKeyBundle,
    ) -> CryptoResult<InitialSession>;

    fn accept_ratchet_session(
        &self,
        me: &IdentityKeyPair,
        signed_prekey: &Curve25519KeyPair,
        one_time_prekey: Option<&Curve25519KeyPair>,
        bundle: &KeyExchangeBundle,
    ) -> CryptoResult<RatchetState>;

    fn ratchet_encrypt(
        &self,
        state: RatchetState,
        plaintext: &[u8],
    ) -> CryptoResult<RatchetEncryptOutput>;

    fn ratchet_decrypt_with_key(
        &self,
        key: &MessageKey,
        message: &RatchetMessage,
    ) -> CryptoResult<Vec<u8>>;

    fn encrypt_group_message(
        &self,
        state: SenderChainState,
        plaintext: &[u8],
    ) -> CryptoResult<GroupEncryptOutput>;

    fn decrypt_group_message(
        &self,
        state: &SenderChainState,
        chain_id: &str,
        iteration: u32,
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>>;
}

/// Production primitives
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardPrimitives;

const WRAP_INFO: &[u8] = b"NoChat Key Wrap v1";

fn wrap_key(dh: &[u8; 32], ephemeral: &[u8], recipient: &[u8]) -> CryptoResult<[u8; 32]> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(ephemeral);
    salt.extend_from_slice(recipient);

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), dh);
    let mut key = [0u8; 32];
    hkdf.expand(WRAP_INFO, &mut key)
        .map_err(|e| CryptoError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;
    Ok(key)
}

impl RatchetPrimitives for StandardPrimitives {
    fn encrypt_for_recipient(
        &self,
        recipient: &IdentityPublicKey,
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let recipient_key = recipient.kem_public()?;
        let ephemeral = Curve25519KeyPair::generate();
        let ephemeral_public = ephemeral.public_key_bytes();

        let mut dh = ephemeral.diffie_hellman(&recipient_key);
        let mut key = wrap_key(&dh, &ephemeral_public, &recipient.kem_key)?;
        dh.zeroize();

        let sealed = aead::seal_combined(&key, plaintext, &recipient.kem_key);
        key.zeroize();

        let mut out = ephemeral_public;
        out.extend_from_slice(&sealed?);
        Ok(out)
    }

    fn decrypt_from_sender(&self, me: &IdentityKeyPair, wrapped: &[u8]) -> CryptoResult<Vec<u8>> {
        if wrapped.len() < 32 + aead::NONCE_LEN {
            return Err(CryptoError::DecryptionError("Wrapped key too short".to_string()));
        }
        let (ephemeral_bytes, sealed) = wrapped.split_at(32);
        let ephemeral = Curve25519PublicKey::from_slice(ephemeral_bytes)?;
        let my_public = me.kem().public_key_bytes();

        let mut dh = me.kem().diffie_hellman(&ephemeral);
        let mut key = wrap_key(&dh, ephemeral_bytes, &my_public)?;
        dh.zeroize();

        let opened = aead::open_combined(&key, sealed, &my_public);
        key.zeroize();
        opened
    }

    fn sign(&self, me: &IdentityKeyPair, bytes: &[u8]) -> Vec<u8> {
        me.sign(bytes)
    }

    fn verify(&self, signer: &IdentityPublicKey, bytes: &[u8], signature: &[u8]) -> bool {
        signer.verify(bytes, signature).is_ok()
    }

    fn create_initial_ratchet_session(
        &self,
        me: &IdentityKeyPair,
        peer_bundle: &PreKeyBundle,
    ) -> CryptoResult<InitialSession> {
        let agreement = x3dh_initiate(me, peer_bundle)?;
        let state = RatchetState::from_shared_secret(&agreement.shared_secret, RatchetRole::Initiator)?;

        Ok(InitialSession {
            state,
            bundle: KeyExchangeBundle {
                identity_key: me.public(),
                ephemeral_key: agreement.ephemeral_public.clone(),
                signed_prekey_id: agreement.signed_prekey_id,
                one_time_prekey_id: agreement.used_one_time_prekey,
            },
        })
    }

    fn accept_ratchet_session(
        &self,
        me: &IdentityKeyPair,
        signed_prekey: &Curve25519KeyPair,
        one_time_prekey: Option<&Curve25519KeyPair>,
        bundle: &KeyExchangeBundle,
    ) -> CryptoResult<RatchetState> {
        let ephemeral = bundle.ephemeral_public()?;
        let mut secret = x3dh_respond(
            me,
            signed_prekey,
            one_time_prekey,
            &bundle.identity_key,
            &ephemeral,
        )?;
        let state = RatchetState::from_shared_secret(&secret, RatchetRole::Responder);
        secret.zeroize();
        state
    }

    fn ratchet_encrypt(
        &self,
        state: RatchetState,
        plaintext: &[u8],
    ) -> CryptoResult<RatchetEncryptOutput> {
        let session_id = state.session_id().to_string();
        let (index, message_key, new_state) = state.step_sending()?;
        let message = RatchetMessage::seal(&message_key, &session_id, index, plaintext)?;

        Ok(RatchetEncryptOutput {
            message,
            new_state,
            message_key,
        })
    }

    fn ratchet_decrypt_with_key(
        &self,
        key: &MessageKey,
        message: &RatchetMessage,
    ) -> CryptoResult<Vec<u8>> {
        message.open(key)
    }

    fn encrypt_group_message(
        &self,
        state: SenderChainState,
        plaintext: &[u8],
    ) -> CryptoResult<GroupEncryptOutput> {
        group::encrypt_group_message(state, plaintext)
    }

    fn decrypt_group_message(
        &self,
        state: &SenderChainState,
        chain_id: &str,
        iteration: u32,
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        group::decrypt_group_message(state, chain_id, iteration, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{OneTimePreKey, SignedPreKey};

    #[test]
    fn test_wrap_unwrap_for_intended_recipient_only() {
        let primitives = StandardPrimitives;
        let bob = IdentityKeyPair::generate();
        let eve = IdentityKeyPair::generate();

        let wrapped = primitives
            .encrypt_for_recipient(&bob.public(), b"message key material")
            .unwrap();

        assert_eq!(
            primitives.decrypt_from_sender(&bob, &wrapped).unwrap(),
            b"message key material"
        );
        assert!(primitives.decrypt_from_sender(&eve, &wrapped).is_err());
        assert!(primitives.decrypt_from_sender(&bob, &wrapped[..20]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let primitives = StandardPrimitives;
        let alice = IdentityKeyPair::generate();
        let signature = primitives.sign(&alice, b"ciphertext");

        assert!(primitives.verify(&alice.public(), b"ciphertext", &signature));
        assert!(!primitives.verify(&alice.public(), b"tampered", &signature));
        assert!(!primitives.verify(&IdentityKeyPair::generate().public(), b"ciphertext", &signature));
    }

    #[test]
    fn test_initial_session_and_accept_share_chains() {
        let primitives = StandardPrimitives;
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let bob_signed = Curve25519KeyPair::generate();
        let bob_otk = Curve25519KeyPair::generate();

        let bundle = PreKeyBundle {
            identity_key: bob.public(),
            signed_prekey: SignedPreKey::new(3, &bob_signed, &bob),
            one_time_prekey: Some(OneTimePreKey::new(9, &bob_otk)),
        };

        let initial = primitives.create_initial_ratchet_session(&alice, &bundle).unwrap();
        assert_eq!(initial.bundle.signed_prekey_id, 3);
        assert_eq!(initial.bundle.one_time_prekey_id, Some(9));

        let bob_state = primitives
            .accept_ratchet_session(&bob, &bob_signed, Some(&bob_otk), &initial.bundle)
            .unwrap();
        assert_eq!(bob_state.session_id(), initial.state.session_id());

        let out = primitives.ratchet_encrypt(initial.state, b"hi").unwrap();
        let (derived, _bob_state) = bob_state.advance_receiving(out.message.index).unwrap();
        let derived = derived.unwrap();
        assert_eq!(derived, out.message_key);
        assert_eq!(
            primitives.ratchet_decrypt_with_key(&derived, &out.message).unwrap(),
            b"hi"
        );
    }

    #[test]
    fn test_full_wrap_then_decrypt_roundtrip() {
        let primitives = StandardPrimitives;
        let bob = IdentityKeyPair::generate();
        let state = RatchetState::from_shared_secret(&[1u8; 32], RatchetRole::Initiator).unwrap();

        let out = primitives.ratchet_encrypt(state, b"round trip").unwrap();
        let wrapped = primitives
            .encrypt_for_recipient(&bob.public(), out.message_key.as_bytes())
            .unwrap();

        let unwrapped = primitives.decrypt_from_sender(&bob, &wrapped).unwrap();
        let key = MessageKey::from_bytes(&unwrapped).unwrap();
        assert_eq!(
            primitives.ratchet_decrypt_with_key(&key, &out.message).unwrap(),
            b"round trip"
        );
    }
}
