//! Shared data types for the network and the sync feed

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::keys::{OneTimePreKey, SignedPreKey};
use crate::crypto::x3dh::KeyExchangeBundle;

pub fn encode_b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_b64(value: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(value)
}

// ============================================================================
// Conversation Types
// ============================================================================

/// Conversation kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConversationKind {
    /// Two-party conversation backed by one pairwise Session
    Direct { peer_id: String },
    /// Group backed by the author's sender chain
    Group { members: Vec<String> },
}

/// Conversation data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(flatten)]
    pub kind: ConversationKind,
}

impl Conversation {
    pub fn direct(id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Direct {
                peer_id: peer_id.into(),
            },
        }
    }

    pub fn group(id: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Group { members },
        }
    }

    /// Members who should receive a wrapped key, the local user included
    pub fn recipients(&self, me: &str) -> Vec<String> {
        match &self.kind {
            ConversationKind::Direct { peer_id } => vec![peer_id.clone(), me.to_string()],
            ConversationKind::Group { members } => {
                let mut recipients = members.clone();
                if !recipients.iter().any(|m| m == me) {
                    recipients.push(me.to_string());
                }
                recipients
            }
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group { .. })
    }
}

// ============================================================================
// Key Exchange Types
// ============================================================================

/// Handshake record transmitted from initiator to responder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeRecord {
    pub exchange_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
    pub conversation_id: String,
    pub bundle: KeyExchangeBundle,
    pub created_at: DateTime<Utc>,
}

/// Inbound handshake that has not been accepted yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExchange {
    pub record: KeyExchangeRecord,
    pub received_at: DateTime<Utc>,
}

impl PendingExchange {
    pub fn from_user_id(&self) -> &str {
        &self.record.from_user_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.record.conversation_id
    }
}

/// Prekey upload body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrekeyUpload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed_prekey: Option<SignedPreKey>,
    pub one_time_prekeys: Vec<OneTimePreKey>,
    /// Replace the server-side pool instead of appending
    #[serde(default)]
    pub replace: bool,
}

// ============================================================================
// Message Types
// ============================================================================

/// One recipient's copy of the message or chain key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyEntry {
    pub recipient_id: String,
    /// Base64 of the asymmetrically wrapped key
    pub wrapped_key: String,
}

/// Per-recipient wrapped keys for one message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKeyEnvelope {
    pub entries: Vec<WrappedKeyEntry>,
}

impl MessageKeyEnvelope {
    pub fn for_recipient(&self, recipient_id: &str) -> Option<&WrappedKeyEntry> {
        self.entries.iter().find(|e| e.recipient_id == recipient_id)
    }

    pub fn recipients(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.recipient_id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encrypted message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "lowercase")]
pub enum EncryptedBody {
    /// Base64 of a serialized pairwise ratchet message
    Pairwise { message: String },
    /// Sender-chain ciphertext
    #[serde(rename_all = "camelCase")]
    Group {
        chain_id: String,
        iteration: u32,
        ciphertext: String,
    },
}

/// Signed message as stored and relayed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub message_id: String,
    /// Incremented on every edit; wrapped keys are fetched per revision
    #[serde(default)]
    pub revision: u32,
    pub conversation_id: String,
    pub sender_id: String,
    pub body: EncryptedBody,
    /// Base64 Ed25519 signature over `signing_bytes()`
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
}

impl MessagePayload {
    /// Canonical bytes covered by the sender's signature
    pub fn signing_bytes(&self) -> Vec<u8> {
        fn field(out: &mut Vec<u8>, value: &[u8]) {
            out.extend_from_slice(&(value.len() as u32).to_be_bytes());
            out.extend_from_slice(value);
        }

        let mut out = Vec::new();
        field(&mut out, b"nochat-message-v1");
        field(&mut out, self.message_id.as_bytes());
        field(&mut out, &self.revision.to_be_bytes());
        field(&mut out, self.conversation_id.as_bytes());
        field(&mut out, self.sender_id.as_bytes());
        match &self.body {
            EncryptedBody::Pairwise { message } => {
                field(&mut out, b"pairwise");
                field(&mut out, message.as_bytes());
            }
            EncryptedBody::Group {
                chain_id,
                iteration,
                ciphertext,
            } => {
                field(&mut out, b"group");
                field(&mut out, chain_id.as_bytes());
                field(&mut out, &iteration.to_be_bytes());
                field(&mut out, ciphertext.as_bytes());
            }
        }
        field(&mut out, self.reply_to.as_deref().unwrap_or("").as_bytes());
        field(
            &mut out,
            &self.expires_at.map_or(0, |t| t.timestamp_millis()).to_be_bytes(),
        );
        field(&mut out, &self.sent_at.timestamp_millis().to_be_bytes());
        out
    }

    /// Key used to de-duplicate deliveries of this payload
    pub fn dedup_key(&self) -> String {
        format!("{}#{}", self.message_id, self.revision)
    }
}

/// Message body plus its per-recipient envelope, as sent to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub envelope: MessageKeyEnvelope,
}

/// Options for an outbound message
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub reply_to: Option<String>,
    pub expires_in: Option<chrono::Duration>,
}

/// Result of a send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted to the server
    Sent { message_id: String },
    /// Ratchet advanced and payload cached; transmission will be retried
    Queued { message_id: String },
}

impl SendOutcome {
    pub fn message_id(&self) -> &str {
        match self {
            SendOutcome::Sent { message_id } | SendOutcome::Queued { message_id } => message_id,
        }
    }
}

/// Decrypted content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum MessageContent {
    Text(String),
    /// No wrapped key exists for this device; only a resend can fix it
    Undecryptable,
}

/// View-model for one message (never persisted encrypted)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptedMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: MessageContent,
    pub sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// emoji -> users who reacted
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub edited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Sender's identity differs from the one captured when the session was created
    #[serde(default)]
    pub identity_changed: bool,
}

impl DecryptedMessage {
    pub fn undecryptable(payload: &MessagePayload) -> Self {
        Self {
            id: payload.message_id.clone(),
            conversation_id: payload.conversation_id.clone(),
            sender_id: payload.sender_id.clone(),
            content: MessageContent::Undecryptable,
            sent_at: payload.sent_at,
            reply_to: payload.reply_to.clone(),
            reactions: BTreeMap::new(),
            edited: payload.revision > 0,
            expires_at: payload.expires_at,
            identity_changed: false,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(text) => Some(text),
            MessageContent::Undecryptable => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

// ============================================================================
// Sync Feed Types
// ============================================================================

/// Event delivered by the real-time feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    NewMessage {
        message: MessagePayload,
    },
    MessageEdited {
        message: MessagePayload,
    },
    MessageDeleted {
        conversation_id: String,
        message_id: String,
    },
    ReactionAdded {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },
    ReactionRemoved {
        conversation_id: String,
        message_id: String,
        user_id: String,
        emoji: String,
    },
    KeyExchange {
        exchange: KeyExchangeRecord,
    },
    Typing {
        conversation_id: String,
        user_id: String,
    },
    MemberAdded {
        conversation_id: String,
        user_id: String,
    },
    MemberRemoved {
        conversation_id: String,
        user_id: String,
    },
    ConversationDeleted {
        conversation_id: String,
    },
    /// The feed connection was re-established
    Reconnected,
}

impl SyncEvent {
    /// Parse one text frame from the feed
    pub fn from_json(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Identifier used for de-duplication, if the event carries one
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            SyncEvent::NewMessage { message } | SyncEvent::MessageEdited { message } => {
                Some(message.dedup_key())
            }
            SyncEvent::MessageDeleted { message_id, .. } => Some(format!("{}#deleted", message_id)),
            SyncEvent::KeyExchange { exchange } => Some(format!("kx:{}", exchange.exchange_id)),
            _ => None,
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            SyncEvent::NewMessage { message } | SyncEvent::MessageEdited { message } => {
                Some(&message.conversation_id)
            }
            SyncEvent::MessageDeleted { conversation_id, .. }
            | SyncEvent::ReactionAdded { conversation_id, .. }
            | SyncEvent::ReactionRemoved { conversation_id, .. }
            | SyncEvent::Typing { conversation_id, .. }
            | SyncEvent::MemberAdded { conversation_id, .. }
            | SyncEvent::MemberRemoved { conversation_id, .. }
            | SyncEvent::ConversationDeleted { conversation_id } => Some(conversation_id),
            SyncEvent::KeyExchange { exchange } => Some(&exchange.conversation_id),
            SyncEvent::Reconnected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> MessagePayload {
        MessagePayload {
            message_id: "m1".to_string(),
            revision: 0,
            conversation_id: "c1".to_string(),
            sender_id: "alice".to_string(),
            body: EncryptedBody::Pairwise {
                message: "AAAA".to_string(),
            },
            signature: String::new(),
            reply_to: None,
            expires_at: None,
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn test_recipients_include_sender() {
        let dm = Conversation::direct("c1", "bob");
        assert_eq!(dm.recipients("alice"), vec!["bob", "alice"]);

        let group = Conversation::group("g1", vec!["alice".into(), "bob".into(), "carol".into()]);
        assert_eq!(group.recipients("alice").len(), 3);

        let group = Conversation::group("g2", vec!["bob".into()]);
        assert_eq!(group.recipients("alice"), vec!["bob", "alice"]);
    }

    #[test]
    fn test_signing_bytes_cover_fields() {
        let base = payload();
        let mut edited = base.clone();
        edited.revision = 1;
        assert_ne!(base.signing_bytes(), edited.signing_bytes());

        let mut replied = base.clone();
        replied.reply_to = Some("m0".to_string());
        assert_ne!(base.signing_bytes(), replied.signing_bytes());

        // Signature itself is not covered
        let mut signed = base.clone();
        signed.signature = "sig".to_string();
        assert_eq!(base.signing_bytes(), signed.signing_bytes());
    }

    #[test]
    fn test_sync_event_parsing() {
        let frame = r#"{"type":"typing","conversationId":"c1","userId":"bob"}"#;
        let event = SyncEvent::from_json(frame).unwrap();
        assert_eq!(
            event,
            SyncEvent::Typing {
                conversation_id: "c1".to_string(),
                user_id: "bob".to_string()
            }
        );
        assert!(event.dedup_key().is_none());

        let reconnect = SyncEvent::from_json(r#"{"type":"reconnected"}"#).unwrap();
        assert_eq!(reconnect, SyncEvent::Reconnected);

        assert!(SyncEvent::from_json(r#"{"type":"presence_update"}"#).is_err());
    }

    #[test]
    fn test_message_event_roundtrip_through_json() {
        let event = SyncEvent::NewMessage { message: payload() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"new_message""#));
        assert_eq!(SyncEvent::from_json(&json).unwrap(), event);
        assert_eq!(event.dedup_key().as_deref(), Some("m1#0"));
    }
}
