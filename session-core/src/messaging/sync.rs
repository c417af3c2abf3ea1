//! Real-time feed consumer
//!
//! Applies feed events to in-memory conversation views. Events are handled
//! one at a time; identifiers already applied are skipped so at-least-once
//! delivery never shows a message twice. Conversations that are not open
//! only count unread messages and raise a notification. Their events are
//! kept and decrypted when the conversation is opened.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::crypto::exchange::KeyExchangeCoordinator;
use crate::error::AppResult;
use crate::messaging::dedup::RecentIds;
use crate::messaging::pipeline::MessagePipeline;
use crate::messaging::typing::TypingTracker;
use crate::models::{Conversation, ConversationKind, DecryptedMessage, SyncEvent};

/// Lightweight signal for the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NewMessage {
        conversation_id: String,
        sender_id: String,
    },
    /// A verification failure the user must be told about
    SecurityEvent {
        conversation_id: String,
        detail: String,
    },
}

#[derive(Default)]
struct ConversationView {
    conversation: Option<Conversation>,
    messages: BTreeMap<String, DecryptedMessage>,
    /// Latest applied revision per message
    revisions: HashMap<String, u32>,
    /// Events received while closed, in arrival order
    queued: VecDeque<SyncEvent>,
    unread: usize,
    open: bool,
}

impl ConversationView {
    fn visible(&self) -> Vec<DecryptedMessage> {
        let now = chrono::Utc::now();
        let mut messages: Vec<DecryptedMessage> = self
            .messages
            .values()
            .filter(|m| !m.is_expired(now))
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
        messages
    }

    fn apply_decrypted(&mut self, message: DecryptedMessage, revision: u32) {
        if let Some(&applied) = self.revisions.get(&message.id) {
            if applied >= revision {
                tracing::debug!("Ignoring stale revision {} of message {}", revision, message.id);
                return;
            }
        }
        self.revisions.insert(message.id.clone(), revision);

        match self.messages.get_mut(&message.id) {
            Some(existing) => {
                let reactions = std::mem::take(&mut existing.reactions);
                *existing = DecryptedMessage { reactions, ..message };
            }
            None => {
                self.messages.insert(message.id.clone(), message);
            }
        }
    }

    /// Hold an event until the conversation is opened
    ///
    /// Copies differing in content are all kept, since only decryption can
    /// tell a forgery from the genuine one. Returns false for an exact
    /// duplicate. The oldest event is dropped once `capacity` is reached.
    fn enqueue(&mut self, event: &SyncEvent, capacity: usize) -> bool {
        if self.queued.contains(event) {
            return false;
        }
        self.queued.push_back(event.clone());
        while self.queued.len() > capacity {
            if let Some(dropped) = self.queued.pop_front() {
                tracing::warn!(
                    "Closed conversation queue full, dropping event {}",
                    dropped.dedup_key().unwrap_or_default()
                );
            }
        }
        true
    }

    fn has_queued_copy(&self, message_id: &str) -> bool {
        self.queued.iter().any(|event| {
            matches!(event, SyncEvent::NewMessage { message } if message.message_id == message_id)
        })
    }

    fn forget_message(&mut self, message_id: &str) {
        self.messages.remove(message_id);
        self.revisions.remove(message_id);
        self.queued.retain(|event| match event {
            SyncEvent::NewMessage { message } | SyncEvent::MessageEdited { message } => {
                message.message_id != message_id
            }
            _ => true,
        });
    }
}

struct ProcessorState {
    seen: RecentIds,
    views: HashMap<String, ConversationView>,
    queue_capacity: usize,
}

/// What applying an event did
enum Applied {
    Done,
    /// Held for a closed conversation; not yet verified
    Queued,
}

/// Consumes the real-time feed for the local user
pub struct SyncEventProcessor {
    user_id: String,
    pipeline: Arc<MessagePipeline>,
    exchange: Arc<KeyExchangeCoordinator>,
    state: Mutex<ProcessorState>,
    typing: std::sync::Mutex<TypingTracker>,
    notifications: mpsc::UnboundedSender<Notification>,
}

impl SyncEventProcessor {
    pub fn new(
        config: &Config,
        pipeline: Arc<MessagePipeline>,
        exchange: Arc<KeyExchangeCoordinator>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (notifications, receiver) = mpsc::unbounded_channel();
        let processor = Self {
            user_id: pipeline.user_id().to_string(),
            pipeline,
            exchange,
            state: Mutex::new(ProcessorState {
                seen: RecentIds::new(&config.dedup),
                views: HashMap::new(),
                queue_capacity: config.dedup.closed_queue_capacity,
            }),
            typing: std::sync::Mutex::new(TypingTracker::new(config.typing_expiry)),
            notifications,
        };
        (processor, receiver)
    }

    fn notify(&self, notification: Notification) {
        // Nobody listening is fine
        let _ = self.notifications.send(notification);
    }

    fn typing(&self) -> std::sync::MutexGuard<'_, TypingTracker> {
        self.typing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make a conversation's membership known to the processor
    pub async fn register_conversation(&self, conversation: Conversation) {
        let mut state = self.state.lock().await;
        let id = conversation.id.clone();
        state.views.entry(id).or_default().conversation = Some(conversation);
    }

    /// Current membership as updated by member events
    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let state = self.state.lock().await;
        state.views.get(conversation_id).and_then(|v| v.conversation.clone())
    }

    /// Consume events until the feed closes
    pub async fn run(&self, mut events: mpsc::Receiver<SyncEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                tracing::warn!("Failed to apply feed event: {}", e);
            }
        }
        tracing::info!("Sync feed closed");
    }

    /// Parse and apply one text frame; unknown or malformed frames are skipped
    pub async fn handle_frame(&self, frame: &str) -> AppResult<()> {
        match SyncEvent::from_json(frame) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                tracing::warn!("Skipping unparseable feed frame: {}", e);
                Ok(())
            }
        }
    }

    /// Apply one event
    ///
    /// An event is remembered as seen only once applied. A forged copy
    /// that fails verification must not suppress the genuine event carrying
    /// the same identifier, so events held for a closed conversation are
    /// marked seen when they decrypt at open time.
    pub async fn handle(&self, event: SyncEvent) -> AppResult<()> {
        let mut state = self.state.lock().await;

        let dedup_key = event.dedup_key();
        if let Some(key) = &dedup_key {
            if state.seen.contains(key) {
                tracing::debug!("Duplicate feed event {}", key);
                return Ok(());
            }
        }

        let result = self.apply(&mut state, &event).await;
        match &result {
            Ok(Applied::Done) => {
                if let Some(key) = dedup_key {
                    state.seen.insert(&key);
                }
            }
            Ok(Applied::Queued) => {}
            Err(e) if e.is_security_event() => {
                tracing::warn!("Security event in feed: {}", e);
                self.notify(Notification::SecurityEvent {
                    conversation_id: event.conversation_id().unwrap_or_default().to_string(),
                    detail: e.to_string(),
                });
            }
            Err(_) => {}
        }
        result.map(|_| ())
    }

    async fn apply(&self, state: &mut ProcessorState, event: &SyncEvent) -> AppResult<Applied> {
        let capacity = state.queue_capacity;
        match event {
            SyncEvent::NewMessage { message } | SyncEvent::MessageEdited { message } => {
                let view = state.views.entry(message.conversation_id.clone()).or_default();
                if !view.open {
                    let first_copy = !view.has_queued_copy(&message.message_id);
                    if !view.enqueue(event, capacity) {
                        return Ok(Applied::Queued);
                    }
                    if first_copy
                        && matches!(event, SyncEvent::NewMessage { .. })
                        && message.sender_id != self.user_id
                    {
                        view.unread += 1;
                        self.notify(Notification::NewMessage {
                            conversation_id: message.conversation_id.clone(),
                            sender_id: message.sender_id.clone(),
                        });
                    }
                    return Ok(Applied::Queued);
                }

                let decrypted = self.pipeline.receive(message).await?;
                view.apply_decrypted(decrypted, message.revision);
            }
            SyncEvent::MessageDeleted {
                conversation_id,
                message_id,
            } => {
                if let Some(view) = state.views.get_mut(conversation_id) {
                    view.forget_message(message_id);
                }
            }
            SyncEvent::ReactionAdded {
                conversation_id,
                message_id,
                user_id,
                emoji,
            }
            | SyncEvent::ReactionRemoved {
                conversation_id,
                message_id,
                user_id,
                emoji,
            } => {
                let view = state.views.entry(conversation_id.clone()).or_default();
                if !view.open {
                    view.enqueue(event, capacity);
                    return Ok(Applied::Queued);
                }

                let Some(message) = view.messages.get_mut(message_id) else {
                    tracing::debug!("Reaction for unknown message {}", message_id);
                    return Ok(Applied::Done);
                };
                if matches!(event, SyncEvent::ReactionAdded { .. }) {
                    message.reactions.entry(emoji.clone()).or_default().insert(user_id.clone());
                } else if let Some(users) = message.reactions.get_mut(emoji) {
                    users.remove(user_id);
                    if users.is_empty() {
                        message.reactions.remove(emoji);
                    }
                }
            }
            SyncEvent::KeyExchange { exchange } => {
                self.exchange.receive_exchange(exchange.clone()).await?;
            }
            SyncEvent::Typing {
                conversation_id,
                user_id,
            } => {
                if user_id != &self.user_id {
                    self.typing().touch(conversation_id, user_id);
                }
            }
            SyncEvent::MemberAdded {
                conversation_id,
                user_id,
            } => {
                if let Some(Conversation {
                    kind: ConversationKind::Group { members },
                    ..
                }) = state
                    .views
                    .get_mut(conversation_id)
                    .and_then(|v| v.conversation.as_mut())
                {
                    if !members.contains(user_id) {
                        members.push(user_id.clone());
                    }
                }
            }
            SyncEvent::MemberRemoved {
                conversation_id,
                user_id,
            } => {
                if let Some(Conversation {
                    kind: ConversationKind::Group { members },
                    ..
                }) = state
                    .views
                    .get_mut(conversation_id)
                    .and_then(|v| v.conversation.as_mut())
                {
                    members.retain(|m| m != user_id);
                }
            }
            SyncEvent::ConversationDeleted { conversation_id } => {
                let view = state.views.remove(conversation_id);
                self.typing().clear_conversation(conversation_id);
                match view.and_then(|v| v.conversation) {
                    Some(conversation) => self.pipeline.delete_conversation(&conversation).await?,
                    None => tracing::debug!("Deleted conversation {} was never registered", conversation_id),
                }
            }
            SyncEvent::Reconnected => {
                let accepted = self.exchange.resync().await?;
                let queued = self.pipeline.retry_all_outboxes().await;
                tracing::info!(
                    "Resynced after reconnect: {} exchanges accepted, {} messages still queued",
                    accepted,
                    queued
                );
            }
        }
        Ok(Applied::Done)
    }

    /// Open a conversation, decrypting everything received while it was closed
    pub async fn open_conversation(&self, conversation_id: &str) -> AppResult<Vec<DecryptedMessage>> {
        let mut state = self.state.lock().await;

        let queued = {
            let view = state.views.entry(conversation_id.to_string()).or_default();
            view.open = true;
            view.unread = 0;
            std::mem::take(&mut view.queued)
        };

        let mut retry_later = Vec::new();
        for event in queued {
            let dedup_key = event.dedup_key();
            if let Some(key) = &dedup_key {
                if state.seen.contains(key) {
                    tracing::debug!("Skipping queued copy of applied event {}", key);
                    continue;
                }
            }
            match self.apply(&mut state, &event).await {
                Ok(_) => {
                    if let Some(key) = dedup_key {
                        state.seen.insert(&key);
                    }
                }
                Err(e) if e.is_security_event() => {
                    tracing::warn!("Dropping message in {}: {}", conversation_id, e);
                    self.notify(Notification::SecurityEvent {
                        conversation_id: conversation_id.to_string(),
                        detail: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!("Deferring event in {}: {}", conversation_id, e);
                    retry_later.push(event);
                }
            }
        }

        let view = state.views.entry(conversation_id.to_string()).or_default();
        view.queued.extend(retry_later);
        Ok(view.visible())
    }

    pub async fn close_conversation(&self, conversation_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(view) = state.views.get_mut(conversation_id) {
            view.open = false;
        }
    }

    /// Decrypted messages ordered by send time, expired ones hidden
    pub async fn messages(&self, conversation_id: &str) -> Vec<DecryptedMessage> {
        let state = self.state.lock().await;
        state
            .views
            .get(conversation_id)
            .map(ConversationView::visible)
            .unwrap_or_default()
    }

    pub async fn unread_count(&self, conversation_id: &str) -> usize {
        let state = self.state.lock().await;
        state.views.get(conversation_id).map_or(0, |v| v.unread)
    }

    pub fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        self.typing().active(conversation_id)
    }
}
