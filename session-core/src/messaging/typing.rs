//! Ephemeral typing indicators

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Tracks who is typing where; entries expire without persistence
#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    last_seen: HashMap<(String, String), Instant>,
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            last_seen: HashMap::new(),
        }
    }

    pub fn touch(&mut self, conversation_id: &str, user_id: &str) {
        self.touch_at(conversation_id, user_id, Instant::now());
    }

    /// Users currently typing in a conversation, sorted
    pub fn active(&mut self, conversation_id: &str) -> Vec<String> {
        self.active_at(conversation_id, Instant::now())
    }

    pub fn clear_conversation(&mut self, conversation_id: &str) {
        self.last_seen.retain(|(conv, _), _| conv != conversation_id);
    }

    fn touch_at(&mut self, conversation_id: &str, user_id: &str, now: Instant) {
        self.last_seen
            .insert((conversation_id.to_string(), user_id.to_string()), now);
    }

    fn active_at(&mut self, conversation_id: &str, now: Instant) -> Vec<String> {
        let expiry = self.expiry;
        self.last_seen
            .retain(|_, at| now.duration_since(*at) < expiry);

        let mut users: Vec<String> = self
            .last_seen
            .keys()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, user)| user.clone())
            .collect();
        users.sort();
        users
    }
}
