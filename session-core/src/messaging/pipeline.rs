//! Outbound and inbound message processing
//!
//! Every conversation has a lane: a task-level lock around its handshake
//! state and outbox. A ratchet step is neither idempotent nor commutative,
//! so all session mutation for one conversation happens with its lane held.
//! Lanes of different conversations never block each other.
//!
//! Send: ratchet (or sender-chain) step, wrap the key for every recipient,
//! sign, transmit. If transmission fails after the step, the already-built
//! payload is kept in the outbox and retransmitted as-is, in order.
//!
//! Receive: verify the sender's signature, fetch and unwrap this device's
//! key, decrypt, then advance the pairwise receiving chain.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::api::ServerApi;
use crate::crypto::exchange::{IdentityDirectory, KeyExchangeCoordinator};
use crate::crypto::group::SenderChainState;
use crate::crypto::keys::{IdentityKeyPair, IdentityPublicKey};
use crate::crypto::primitives::RatchetPrimitives;
use crate::crypto::ratchet::{MessageKey, RatchetMessage};
use crate::crypto::sessions::{Session, SessionState, SessionStore};
use crate::crypto::vault::SecretKeyVault;
use crate::crypto::wrapper::MessageKeyWrapper;
use crate::error::{AppError, AppResult, MessageError};
use crate::models::{
    decode_b64, encode_b64, Conversation, ConversationKind, DecryptedMessage, EncryptedBody,
    MessageContent, MessageKeyEnvelope, MessagePayload, OutboundMessage, SendOptions, SendOutcome,
};

/// Handshake state of a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    NoSession,
    HandshakeInFlight,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransmissionKind {
    Send,
    Edit,
}

struct QueuedTransmission {
    kind: TransmissionKind,
    message: OutboundMessage,
}

struct Lane {
    state: ConversationState,
    outbox: VecDeque<QueuedTransmission>,
    /// Latest revision of messages sent from this device
    revisions: HashMap<String, u32>,
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            state: ConversationState::NoSession,
            outbox: VecDeque::new(),
            revisions: HashMap::new(),
        }
    }
}

/// Errors worth keeping an already-stepped payload for
fn should_queue(error: &AppError) -> bool {
    error.is_transient() || matches!(error, AppError::SessionExpired | AppError::NotAuthenticated)
}

fn malformed(what: &str, e: impl std::fmt::Display) -> AppError {
    MessageError::Malformed(format!("{}: {}", what, e)).into()
}

/// Orchestrates send and receive for DMs and groups
pub struct MessagePipeline {
    user_id: String,
    identity: Arc<IdentityKeyPair>,
    primitives: Arc<dyn RatchetPrimitives>,
    api: Arc<dyn ServerApi>,
    sessions: Arc<SessionStore>,
    exchange: Arc<KeyExchangeCoordinator>,
    directory: Arc<IdentityDirectory>,
    vault: Arc<SecretKeyVault>,
    wrapper: MessageKeyWrapper,
    lanes: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<Lane>>>>,
}

impl MessagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        identity: Arc<IdentityKeyPair>,
        primitives: Arc<dyn RatchetPrimitives>,
        api: Arc<dyn ServerApi>,
        sessions: Arc<SessionStore>,
        exchange: Arc<KeyExchangeCoordinator>,
        directory: Arc<IdentityDirectory>,
        vault: Arc<SecretKeyVault>,
    ) -> Self {
        let wrapper = MessageKeyWrapper::new(user_id, identity.clone(), primitives.clone(), directory.clone());
        Self {
            user_id: user_id.to_string(),
            identity,
            primitives,
            api,
            sessions,
            exchange,
            directory,
            vault,
            wrapper,
            lanes: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn lane(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<Lane>> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.entry(conversation_id.to_string()).or_default().clone()
    }

    fn lane_ids(&self) -> Vec<String> {
        let lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        lanes.keys().cloned().collect()
    }

    pub async fn conversation_state(&self, conversation_id: &str) -> ConversationState {
        self.lane(conversation_id).lock().await.state
    }

    /// Number of already-encrypted payloads waiting for transmission
    pub async fn outbox_len(&self, conversation_id: &str) -> usize {
        self.lane(conversation_id).lock().await.outbox.len()
    }

    /// Persist a session; failures are logged and never block the caller
    async fn persist(&self, session: &Session) {
        if let Err(e) = self.sessions.save(session).await {
            tracing::warn!(
                "Session {}/{} advanced but not saved locally: {}",
                session.conversation_id,
                session.peer_id,
                e
            );
        }
    }

    // ========================================================================
    // Send
    // ========================================================================

    /// Make sure a DM has a session, accepting a pending inbound handshake
    /// before starting a new one.
    async fn ensure_ready(&self, conversation: &Conversation, lane: &mut Lane) -> AppResult<()> {
        let ConversationKind::Direct { peer_id } = &conversation.kind else {
            lane.state = ConversationState::Ready;
            return Ok(());
        };

        if self.sessions.exists(&conversation.id, peer_id).await? {
            lane.state = ConversationState::Ready;
            return Ok(());
        }

        lane.state = ConversationState::HandshakeInFlight;
        let result = match self.exchange.accept_pending_for(peer_id, &conversation.id).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self.exchange.initiate(peer_id, &conversation.id).await.map(|_| ()),
            Err(e) => Err(e),
        };

        lane.state = match result {
            Ok(()) => ConversationState::Ready,
            Err(_) => ConversationState::NoSession,
        };
        result
    }

    /// Step the conversation's ratchet and wrap the resulting key material
    async fn encrypt(
        &self,
        conversation: &Conversation,
        plaintext: &[u8],
    ) -> AppResult<(EncryptedBody, MessageKeyEnvelope)> {
        let recipients = conversation.recipients(&self.user_id);

        match &conversation.kind {
            ConversationKind::Direct { peer_id } => {
                let mut session = self.sessions.load(&conversation.id, peer_id).await?.ok_or_else(|| {
                    AppError::SessionUnavailable {
                        conversation_id: conversation.id.clone(),
                        peer_id: peer_id.clone(),
                    }
                })?;
                let SessionState::Pairwise(state) = session.state.clone() else {
                    return Err(AppError::Internal(format!(
                        "Session {}/{} is not pairwise",
                        conversation.id, peer_id
                    )));
                };

                let out = self.primitives.ratchet_encrypt(state, plaintext)?;
                session.state = SessionState::Pairwise(out.new_state);
                session.messages_sent += 1;
                self.persist(&session).await;

                let envelope = self.wrapper.wrap(out.message_key.as_bytes(), &recipients).await?;
                let body = EncryptedBody::Pairwise {
                    message: encode_b64(&out.message.to_bytes()?),
                };
                Ok((body, envelope))
            }
            ConversationKind::Group { .. } => {
                let mut session = match self.sessions.load(&conversation.id, &self.user_id).await? {
                    Some(existing) if existing.members.iter().all(|m| recipients.contains(m)) => existing,
                    Some(_) => {
                        tracing::info!("Member removed from {}, rotating sender chain", conversation.id);
                        Session::sender_chain(&conversation.id, &self.user_id, recipients.clone())
                    }
                    None => Session::sender_chain(&conversation.id, &self.user_id, recipients.clone()),
                };
                session.members = recipients.clone();

                let SessionState::SenderChain(chain) = session.state.clone() else {
                    return Err(AppError::Internal(format!(
                        "Session {}/{} is not a sender chain",
                        conversation.id, self.user_id
                    )));
                };

                let out = self.primitives.encrypt_group_message(chain, plaintext)?;
                session.state = SessionState::SenderChain(out.new_state);
                session.messages_sent += 1;
                self.persist(&session).await;

                let material = Zeroizing::new(out.message_chain.to_bytes()?);
                let envelope = self.wrapper.wrap(&material, &recipients).await?;
                let body = EncryptedBody::Group {
                    chain_id: out.chain_id,
                    iteration: out.iteration,
                    ciphertext: encode_b64(&out.ciphertext),
                };
                Ok((body, envelope))
            }
        }
    }

    fn sign(&self, mut payload: MessagePayload, envelope: MessageKeyEnvelope) -> OutboundMessage {
        let signature = self.primitives.sign(&self.identity, &payload.signing_bytes());
        payload.signature = encode_b64(&signature);
        OutboundMessage { payload, envelope }
    }

    async fn build(
        &self,
        conversation: &Conversation,
        message_id: String,
        revision: u32,
        text: &str,
        options: &SendOptions,
    ) -> AppResult<OutboundMessage> {
        let (body, envelope) = self.encrypt(conversation, text.as_bytes()).await?;
        let sent_at = chrono::Utc::now();

        let payload = MessagePayload {
            message_id,
            revision,
            conversation_id: conversation.id.clone(),
            sender_id: self.user_id.clone(),
            body,
            signature: String::new(),
            reply_to: options.reply_to.clone(),
            expires_at: options.expires_in.map(|d| sent_at + d),
            sent_at,
        };
        Ok(self.sign(payload, envelope))
    }

    /// Transmit in order behind anything already queued
    async fn transmit(&self, lane: &mut Lane, queued: QueuedTransmission) -> AppResult<SendOutcome> {
        let message_id = queued.message.payload.message_id.clone();

        self.flush_outbox(lane).await;
        if !lane.outbox.is_empty() {
            lane.outbox.push_back(queued);
            return Ok(SendOutcome::Queued { message_id });
        }

        match self.transmit_one(&queued).await {
            Ok(()) => Ok(SendOutcome::Sent { message_id }),
            Err(e) if should_queue(&e) => {
                tracing::warn!("Message {} queued for retry: {}", message_id, e);
                lane.outbox.push_back(queued);
                Ok(SendOutcome::Queued { message_id })
            }
            Err(e) => Err(e),
        }
    }

    async fn transmit_one(&self, queued: &QueuedTransmission) -> AppResult<()> {
        match queued.kind {
            TransmissionKind::Send => self.api.send_message(&queued.message).await,
            TransmissionKind::Edit => self.api.edit_message(&queued.message).await,
        }
    }

    async fn flush_outbox(&self, lane: &mut Lane) {
        while let Some(next) = lane.outbox.front() {
            match self.transmit_one(next).await {
                Ok(()) => {
                    tracing::debug!("Delivered queued message {}", next.message.payload.message_id);
                    lane.outbox.pop_front();
                }
                Err(e) if should_queue(&e) => {
                    tracing::debug!("Outbox still blocked: {}", e);
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        "Dropping queued message {} after permanent failure: {}",
                        next.message.payload.message_id,
                        e
                    );
                    lane.outbox.pop_front();
                }
            }
        }
    }

    /// Encrypt and send a text message
    pub async fn send(
        &self,
        conversation: &Conversation,
        text: &str,
        options: SendOptions,
    ) -> AppResult<SendOutcome> {
        let lane = self.lane(&conversation.id);
        let mut lane = lane.lock().await;

        self.ensure_ready(conversation, &mut lane).await?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let message = self
            .build(conversation, message_id.clone(), 0, text, &options)
            .await?;
        lane.revisions.insert(message_id, 0);

        self.transmit(
            &mut lane,
            QueuedTransmission {
                kind: TransmissionKind::Send,
                message,
            },
        )
        .await
    }

    /// Replace the content of a sent message with a newly encrypted revision
    pub async fn edit(
        &self,
        conversation: &Conversation,
        message_id: &str,
        text: &str,
    ) -> AppResult<SendOutcome> {
        let lane = self.lane(&conversation.id);
        let mut lane = lane.lock().await;

        self.ensure_ready(conversation, &mut lane).await?;
        let revision = lane.revisions.get(message_id).map_or(1, |r| r + 1);
        let message = self
            .build(conversation, message_id.to_string(), revision, text, &SendOptions::default())
            .await?;
        lane.revisions.insert(message_id.to_string(), revision);

        self.transmit(
            &mut lane,
            QueuedTransmission {
                kind: TransmissionKind::Edit,
                message,
            },
        )
        .await
    }

    pub async fn delete_message(&self, conversation_id: &str, message_id: &str) -> AppResult<()> {
        self.api.delete_message(conversation_id, message_id).await?;
        self.lane(conversation_id).lock().await.revisions.remove(message_id);
        Ok(())
    }

    pub async fn react(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()> {
        self.api.add_reaction(conversation_id, message_id, emoji).await
    }

    pub async fn unreact(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()> {
        self.api.remove_reaction(conversation_id, message_id, emoji).await
    }

    /// Retransmit queued payloads of one conversation; returns how many remain
    pub async fn retry_outbox(&self, conversation_id: &str) -> usize {
        let lane = self.lane(conversation_id);
        let mut lane = lane.lock().await;
        self.flush_outbox(&mut lane).await;
        lane.outbox.len()
    }

    /// Retransmit every conversation's outbox; returns the total still queued
    pub async fn retry_all_outboxes(&self) -> usize {
        let mut remaining = 0;
        for conversation_id in self.lane_ids() {
            remaining += self.retry_outbox(&conversation_id).await;
        }
        remaining
    }

    /// Forget a conversation's lane and remove its sessions everywhere
    pub async fn delete_conversation(&self, conversation: &Conversation) -> AppResult<()> {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes.remove(&conversation.id)
        };
        if let Some(lane) = lane {
            let dropped = lane.lock().await.outbox.len();
            if dropped > 0 {
                tracing::warn!("Dropping {} queued messages of deleted conversation {}", dropped, conversation.id);
            }
        }

        let peers = match &conversation.kind {
            ConversationKind::Direct { peer_id } => vec![peer_id.clone()],
            ConversationKind::Group { .. } => vec![self.user_id.clone()],
        };
        self.sessions.delete_conversation(&conversation.id, &peers).await
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Check the sender's signature against their published identity
    ///
    /// A cached key that fails is refreshed once before rejecting.
    async fn verify_sender(&self, payload: &MessagePayload, signing_bytes: &[u8]) -> AppResult<IdentityPublicKey> {
        let rejected = || -> AppError {
            tracing::warn!(
                "Rejected message {} from {}: signature does not verify",
                payload.message_id,
                payload.sender_id
            );
            MessageError::TamperedOrUnverifiable(payload.message_id.clone()).into()
        };

        let Ok(signature) = decode_b64(&payload.signature) else {
            return Err(rejected());
        };

        if payload.sender_id == self.user_id {
            let own = self.identity.public();
            return if self.primitives.verify(&own, signing_bytes, &signature) {
                Ok(own)
            } else {
                Err(rejected())
            };
        }

        if let Some(cached) = self.directory.get(&payload.sender_id).await? {
            if self.primitives.verify(&cached, signing_bytes, &signature) {
                return Ok(cached);
            }
        }
        if let Some(fresh) = self.directory.refresh(&payload.sender_id).await? {
            if self.primitives.verify(&fresh, signing_bytes, &signature) {
                return Ok(fresh);
            }
        }
        Err(rejected())
    }

    /// Advance the pairwise receiving chain after a successful decrypt
    async fn advance_receiving(&self, payload: &MessagePayload, index: u32) {
        let (conversation_id, sender_id) = (&payload.conversation_id, &payload.sender_id);

        let session = match self.sessions.load(conversation_id, sender_id).await {
            Ok(Some(session)) => Some(session),
            Ok(None) => match self.exchange.accept_pending_for(sender_id, conversation_id).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("Pending exchange from {} could not be accepted: {}", sender_id, e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Session {}/{} unavailable: {}", conversation_id, sender_id, e);
                None
            }
        };

        let Some(mut session) = session else {
            tracing::debug!("No session with {} in {}; decrypted from wrapped key only", sender_id, conversation_id);
            return;
        };
        let SessionState::Pairwise(state) = session.state.clone() else {
            return;
        };

        match state.advance_receiving(index) {
            Ok((key, new_state)) => {
                if key.is_some() {
                    session.messages_received += 1;
                }
                session.state = SessionState::Pairwise(new_state);
                self.persist(&session).await;
            }
            Err(e) => tracing::warn!("Receiving chain for {}/{} not advanced: {}", conversation_id, sender_id, e),
        }
    }

    /// Whether the sender's verified identity differs from the one captured
    /// for them (session, or pin for group members)
    async fn identity_changed(&self, payload: &MessagePayload, signer: &IdentityPublicKey) -> AppResult<bool> {
        if payload.sender_id == self.user_id {
            return Ok(false);
        }
        if let Some(session) = self.sessions.load(&payload.conversation_id, &payload.sender_id).await? {
            if let Some(captured) = session.peer_identity {
                return Ok(&captured != signer);
            }
        }
        Ok(self
            .vault
            .pinned_identity(&payload.sender_id)
            .await?
            .is_some_and(|pinned| &pinned != signer))
    }

    /// Decrypt one inbound message
    ///
    /// A message without a usable wrapped key becomes an undecryptable
    /// placeholder. A failed authenticity check is an error and the message
    /// must not be shown.
    pub async fn receive(&self, payload: &MessagePayload) -> AppResult<DecryptedMessage> {
        let lane = self.lane(&payload.conversation_id);
        let _lane = lane.lock().await;

        let signing_bytes = payload.signing_bytes();
        let signer = self.verify_sender(payload, &signing_bytes).await?;

        let Some(entry) = self
            .api
            .fetch_wrapped_key(&payload.message_id, payload.revision)
            .await?
        else {
            tracing::warn!("No wrapped key for message {} on this device", payload.message_id);
            return Ok(DecryptedMessage::undecryptable(payload));
        };

        let material = match self.wrapper.unwrap(&payload.message_id, &entry) {
            Ok(material) => material,
            Err(AppError::Message(MessageError::KeyUnavailable(_))) => {
                return Ok(DecryptedMessage::undecryptable(payload))
            }
            Err(e) => return Err(e),
        };

        let tampered = |_| -> AppError { MessageError::TamperedOrUnverifiable(payload.message_id.clone()).into() };

        let plaintext = match &payload.body {
            EncryptedBody::Pairwise { message } => {
                let bytes = decode_b64(message).map_err(|e| malformed("ratchet message", e))?;
                let message = RatchetMessage::from_bytes(&bytes).map_err(|e| malformed("ratchet message", e))?;
                let key = MessageKey::from_bytes(&material).map_err(|e| malformed("message key", e))?;
                let plaintext = self
                    .primitives
                    .ratchet_decrypt_with_key(&key, &message)
                    .map_err(tampered)?;

                if payload.sender_id != self.user_id {
                    self.advance_receiving(payload, message.index).await;
                }
                plaintext
            }
            EncryptedBody::Group {
                chain_id,
                iteration,
                ciphertext,
            } => {
                let chain = SenderChainState::from_bytes(&material).map_err(|e| malformed("chain snapshot", e))?;
                let ciphertext = decode_b64(ciphertext).map_err(|e| malformed("group ciphertext", e))?;
                self.primitives
                    .decrypt_group_message(&chain, chain_id, *iteration, &ciphertext)
                    .map_err(tampered)?
            }
        };

        let text = String::from_utf8(plaintext).map_err(|e| malformed("message text", e))?;
        let identity_changed = self.identity_changed(payload, &signer).await?;
        if identity_changed {
            tracing::warn!("Identity of {} changed since the session was created", payload.sender_id);
        }

        Ok(DecryptedMessage {
            id: payload.message_id.clone(),
            conversation_id: payload.conversation_id.clone(),
            sender_id: payload.sender_id.clone(),
            content: MessageContent::Text(text),
            sent_at: payload.sent_at,
            reply_to: payload.reply_to.clone(),
            reactions: Default::default(),
            edited: payload.revision > 0,
            expires_at: payload.expires_at,
            identity_changed,
        })
    }
}
