//! End-to-end encryption for NoChat sessions
//!
//! ## Components
//!
//! - **keys**: Key generation and storage (identity, signed prekeys, one-time prekeys)
//! - **x3dh**: Extended Triple Diffie-Hellman for asynchronous key agreement
//! - **ratchet**: Symmetric chain ratchet for per-message forward secrecy
//! - **group**: Sender chains for group conversations
//! - **primitives**: The `RatchetPrimitives` contract the session layer calls through
//! - **vault**: Encrypted-at-rest secret storage (SQLite-backed)
//! - **prekeys**: Prekey publication, rotation and replenishment
//! - **sessions**: Session storage, local and network-backed
//! - **persist_queue**: Background network persistence with retry
//! - **exchange**: Handshake coordination, identity directory, safety numbers
//! - **wrapper**: Per-recipient wrapping of message keys
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nochat_session::crypto::{KeyExchangeCoordinator, MessageKeyWrapper};
//!
//! // Establish a session with a peer
//! let session = coordinator.initiate("bob", "conversation-1").await?;
//!
//! // Wrap a message key for every member, the sender included
//! let envelope = wrapper.wrap(message_key.as_bytes(), &recipients).await?;
//! ```

pub mod aead;
pub mod errors;
pub mod exchange;
pub mod group;
pub mod keys;
pub mod persist_queue;
pub mod prekeys;
pub mod primitives;
pub mod ratchet;
pub mod sessions;
pub mod vault;
pub mod wrapper;
pub mod x3dh;

// Re-export commonly used types
pub use errors::{CryptoError, CryptoResult};
pub use exchange::{safety_number, IdentityDirectory, KeyExchangeCoordinator, SafetyStatus};
pub use group::SenderChainState;
pub use keys::{Curve25519KeyPair, IdentityKeyPair, IdentityPublicKey, OneTimePreKey, SignedPreKey};
pub use persist_queue::PersistQueue;
pub use prekeys::{PreKeyStatus, PrekeyLifecycleManager, PrekeyReport};
pub use primitives::{RatchetPrimitives, StandardPrimitives};
pub use ratchet::{MessageKey, RatchetMessage, RatchetState};
pub use sessions::{Session, SessionState, SessionStats, SessionStore};
pub use vault::{SecretKeyVault, VaultKey};
pub use wrapper::MessageKeyWrapper;
pub use x3dh::{x3dh_initiate, x3dh_respond, KeyExchangeBundle, PreKeyBundle, X3dhResult};
