//! Sender chains for group messaging
//!
//! The current author of a group advances one symmetric chain per message
//! and wraps a snapshot of the chain (at the message's iteration) for every
//! member. A member holding the snapshot can derive the key for that
//! iteration and any later one, never an earlier one.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::aead;
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::ratchet::{hmac_step, MessageKey, MAX_SKIP};

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

/// State of one sender chain
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct SenderChainState {
    /// Stays constant across ratchet steps; changes on rotation
    #[zeroize(skip)]
    chain_id: String,
    #[zeroize(skip)]
    iteration: u32,
    chain_key: [u8; 32],
}

impl SenderChainState {
    /// Start a new chain from a random seed
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let state = Self {
            chain_id: uuid::Uuid::new_v4().to_string(),
            iteration: 0,
            chain_key: seed,
        };
        seed.zeroize();
        state
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    fn message_key(&self) -> CryptoResult<MessageKey> {
        MessageKey::from_bytes(&hmac_step(&self.chain_key, MESSAGE_KEY_SEED)?)
    }

    fn next(&self) -> CryptoResult<SenderChainState> {
        Ok(SenderChainState {
            chain_id: self.chain_id.clone(),
            iteration: self.iteration + 1,
            chain_key: hmac_step(&self.chain_key, CHAIN_KEY_SEED)?,
        })
    }

    /// Fast-forward a copy of this chain to `iteration`
    fn at_iteration(&self, iteration: u32) -> CryptoResult<SenderChainState> {
        if iteration < self.iteration {
            return Err(CryptoError::SenderChainError(format!(
                "Iteration {} precedes chain position {}",
                iteration, self.iteration
            )));
        }
        if iteration - self.iteration > MAX_SKIP {
            return Err(CryptoError::SenderChainError(format!(
                "Iteration {} is too far ahead of chain position {}",
                iteration, self.iteration
            )));
        }

        let mut chain = self.clone();
        while chain.iteration < iteration {
            chain = chain.next()?;
        }
        Ok(chain)
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(Into::into)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::SenderChainError(format!("Invalid chain state: {}", e)))
    }
}

impl std::fmt::Debug for SenderChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderChainState")
            .field("chain_id", &self.chain_id)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

/// Output of one group encryption step
pub struct GroupEncryptOutput {
    pub ciphertext: Vec<u8>,
    pub chain_id: String,
    pub iteration: u32,
    /// Chain snapshot at `iteration`, the material wrapped for members
    pub message_chain: SenderChainState,
    /// Advanced chain the author keeps
    pub new_state: SenderChainState,
}

fn aad(chain_id: &str, iteration: u32) -> Vec<u8> {
    let mut aad = Vec::with_capacity(chain_id.len() + 4);
    aad.extend_from_slice(chain_id.as_bytes());
    aad.extend_from_slice(&iteration.to_be_bytes());
    aad
}

/// Encrypt one group message and advance the chain
pub fn encrypt_group_message(
    state: SenderChainState,
    plaintext: &[u8],
) -> CryptoResult<GroupEncryptOutput> {
    let key = state.message_key()?;
    let ciphertext = aead::seal_combined(
        key.as_bytes(),
        plaintext,
        &aad(&state.chain_id, state.iteration),
    )?;
    let new_state = state.next()?;

    Ok(GroupEncryptOutput {
        ciphertext,
        chain_id: state.chain_id.clone(),
        iteration: state.iteration,
        message_chain: state,
        new_state,
    })
}

/// Decrypt a group message with a chain snapshot the member received
pub fn decrypt_group_message(
    state: &SenderChainState,
    chain_id: &str,
    iteration: u32,
    ciphertext: &[u8],
) -> CryptoResult<Vec<u8>> {
    if state.chain_id != chain_id {
        return Err(CryptoError::SenderChainError(format!(
            "Chain {} does not match message chain {}",
            state.chain_id, chain_id
        )));
    }

    let chain = state.at_iteration(iteration)?;
    let key = chain.message_key()?;
    aead::open_combined(key.as_bytes(), ciphertext, &aad(chain_id, iteration))
}
