//! Pairwise ratchet
//!
//! A symmetric-key ratchet seeded from the X3DH shared secret. Each side
//! owns a sending chain and a receiving chain; the initiator's sending
//! chain is the responder's receiving chain and vice versa.
//!
//! Every step derives a one-time message key and replaces the chain key
//! with `HMAC(chain_key, 0x02)`. HMAC is one-way, so a chain key at step N
//! reveals nothing about the message keys of steps before N. States are
//! consumed by value on every step so the previous state cannot be kept
//! around by accident.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::aead;
use crate::crypto::errors::{CryptoError, CryptoResult};

type HmacSha256 = Hmac<Sha256>;

/// Largest gap the receiving chain may be fast-forwarded in one step
pub const MAX_SKIP: u32 = 2000;

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

pub(crate) fn hmac_step(key: &[u8; 32], seed: u8) -> CryptoResult<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::RatchetError(e.to_string()))?;
    mac.update(&[seed]);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// A single-use key for one message
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MessageKey([u8; 32]);

impl MessageKey {
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Message key must be 32 bytes".to_string()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MessageKey(..)")
    }
}

/// One KDF chain
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    #[zeroize(skip)]
    index: u32,
}

impl ChainKey {
    fn new(key: [u8; 32]) -> Self {
        Self { key, index: 0 }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    fn message_key(&self) -> CryptoResult<MessageKey> {
        Ok(MessageKey(hmac_step(&self.key, MESSAGE_KEY_SEED)?))
    }

    fn next(&self) -> CryptoResult<ChainKey> {
        Ok(ChainKey {
            key: hmac_step(&self.key, CHAIN_KEY_SEED)?,
            index: self.index + 1,
        })
    }
}

/// Which side of the handshake produced this state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatchetRole {
    Initiator,
    Responder,
}

/// Opaque ratchet state owned by exactly one Session
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct RatchetState {
    #[zeroize(skip)]
    role: RatchetRole,
    /// Identifier both sides derive from the same shared secret
    #[zeroize(skip)]
    session_id: String,
    sending: ChainKey,
    receiving: ChainKey,
}

impl RatchetState {
    /// Seed both chains from an X3DH shared secret
    pub fn from_shared_secret(shared_secret: &[u8; 32], role: RatchetRole) -> CryptoResult<Self> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
        let mut okm = [0u8; 72];
        hkdf.expand(b"NoChat Ratchet v1", &mut okm)
            .map_err(|e| CryptoError::RatchetError(format!("HKDF expansion failed: {}", e)))?;

        let mut forward = [0u8; 32];
        let mut backward = [0u8; 32];
        forward.copy_from_slice(&okm[..32]);
        backward.copy_from_slice(&okm[32..64]);
        let session_id = hex::encode(&okm[64..72]);
        okm.zeroize();

        let (sending, receiving) = match role {
            RatchetRole::Initiator => (ChainKey::new(forward), ChainKey::new(backward)),
            RatchetRole::Responder => (ChainKey::new(backward), ChainKey::new(forward)),
        };
        forward.zeroize();
        backward.zeroize();

        Ok(Self {
            role,
            session_id,
            sending,
            receiving,
        })
    }

    pub fn role(&self) -> RatchetRole {
        self.role
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sending_index(&self) -> u32 {
        self.sending.index
    }

    pub fn receiving_index(&self) -> u32 {
        self.receiving.index
    }

    /// One sending step: returns the message key for the current index and
    /// the advanced state.
    pub fn step_sending(self) -> CryptoResult<(u32, MessageKey, RatchetState)> {
        let index = self.sending.index;
        let key = self.sending.message_key()?;
        let next = RatchetState {
            role: self.role,
            session_id: self.session_id.clone(),
            sending: self.sending.next()?,
            receiving: self.receiving.clone(),
        };
        Ok((index, key, next))
    }

    /// Fast-forward the receiving chain past `index`.
    ///
    /// Returns the derived key for `index`, or `None` when the chain is
    /// already beyond it (replayed or reordered message).
    pub fn advance_receiving(self, index: u32) -> CryptoResult<(Option<MessageKey>, RatchetState)> {
        if index < self.receiving.index {
            return Ok((None, self));
        }
        if index - self.receiving.index > MAX_SKIP {
            return Err(CryptoError::RatchetError(format!(
                "Message index {} is too far ahead of receiving chain at {}",
                index, self.receiving.index
            )));
        }

        let mut chain = self.receiving.clone();
        while chain.index < index {
            chain = chain.next()?;
        }
        let key = chain.message_key()?;

        let next = RatchetState {
            role: self.role,
            session_id: self.session_id.clone(),
            sending: self.sending.clone(),
            receiving: chain.next()?,
        };
        Ok((Some(key), next))
    }
}

/// Ciphertext produced by one ratchet step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatchetMessage {
    pub session_id: String,
    pub index: u32,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    fn aad(session_id: &str, index: u32) -> Vec<u8> {
        let mut aad = Vec::with_capacity(session_id.len() + 4);
        aad.extend_from_slice(session_id.as_bytes());
        aad.extend_from_slice(&index.to_be_bytes());
        aad
    }

    pub fn seal(key: &MessageKey, session_id: &str, index: u32, plaintext: &[u8]) -> CryptoResult<Self> {
        let (nonce, ciphertext) = aead::seal(key.as_bytes(), plaintext, &Self::aad(session_id, index))?;
        Ok(Self {
            session_id: session_id.to_string(),
            index,
            nonce: nonce.to_vec(),
            ciphertext,
        })
    }

    pub fn open(&self, key: &MessageKey) -> CryptoResult<Vec<u8>> {
        aead::open(
            key.as_bytes(),
            &self.nonce,
            &self.ciphertext,
            &Self::aad(&self.session_id, self.index),
        )
    }

    /// Serialize to bytes for transmission
    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            CryptoError::DecryptionError(format!("Invalid ratchet message: {}", e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (RatchetState, RatchetState) {
        let secret = [42u8; 32];
        (
            RatchetState::from_shared_secret(&secret, RatchetRole::Initiator).unwrap(),
            RatchetState::from_shared_secret(&secret, RatchetRole::Responder).unwrap(),
        )
    }

    #[test]
    fn test_both_sides_share_session_id() {
        let (alice, bob) = pair();
        assert_eq!(alice.session_id(), bob.session_id());
        assert_eq!(alice.role(), RatchetRole::Initiator);
        assert_eq!(bob.role(), RatchetRole::Responder);
    }

    #[test]
    fn test_sending_chain_matches_peer_receiving_chain() {
        let (alice, bob) = pair();

        let (index, alice_key, alice) = alice.step_sending().unwrap();
        assert_eq!(index, 0);
        assert_eq!(alice.sending_index(), 1);

        let (bob_key, bob) = bob.advance_receiving(index).unwrap();
        assert_eq!(bob_key.unwrap(), alice_key);
        assert_eq!(bob.receiving_index(), 1);

        // Replies travel on the other chain
        let (reply_index, reply_key, _bob) = bob.step_sending().unwrap();
        let (alice_reply_key, _alice) = alice.advance_receiving(reply_index).unwrap();
        assert_eq!(alice_reply_key.unwrap(), reply_key);
    }

    #[test]
    fn test_advance_receiving_skips_and_ignores_old_indices() {
        let (alice, bob) = pair();
        let (_, _, alice) = alice.step_sending().unwrap();
        let (_, _, alice) = alice.step_sending().unwrap();
        let (index, key, _alice) = alice.step_sending().unwrap();
        assert_eq!(index, 2);

        let (skipped_key, bob) = bob.advance_receiving(2).unwrap();
        assert_eq!(skipped_key.unwrap(), key);

        let (old, bob) = bob.advance_receiving(1).unwrap();
        assert!(old.is_none());
        assert_eq!(bob.receiving_index(), 3);

        assert!(bob.advance_receiving(3 + MAX_SKIP + 1).is_err());
    }

    #[test]
    fn test_message_roundtrip_with_key() {
        let (alice, _) = pair();
        let session_id = alice.session_id().to_string();
        let (index, key, _alice) = alice.step_sending().unwrap();

        let message = RatchetMessage::seal(&key, &session_id, index, b"hi").unwrap();
        let bytes = message.to_bytes().unwrap();
        let parsed = RatchetMessage::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.open(&key).unwrap(), b"hi");

        let mut tampered = parsed.clone();
        tampered.index += 1;
        assert!(tampered.open(&key).is_err());
    }

    #[test]
    fn test_later_state_cannot_recover_earlier_keys() {
        let (alice, _) = pair();
        let session_id = alice.session_id().to_string();
        let (index, key, alice) = alice.step_sending().unwrap();
        let message = RatchetMessage::seal(&key, &session_id, index, b"secret").unwrap();

        // Walk the later state forward and try every key it can produce
        let mut state = alice;
        for _ in 0..16 {
            let (_, later_key, next) = state.step_sending().unwrap();
            assert_ne!(later_key, key);
            assert!(message.open(&later_key).is_err());
            state = next;
        }
    }
}
