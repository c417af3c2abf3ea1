//! Bounded set of recently seen event identifiers

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::DedupConfig;

/// Remembers identifiers for at most `window`, keeping at most `capacity`
/// of them. The oldest entries are evicted first.
#[derive(Debug)]
pub struct RecentIds {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    capacity: usize,
    window: Duration,
}

impl RecentIds {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: config.capacity.max(1),
            window: config.window,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.contains_at(id, Instant::now())
    }

    /// Record `id`; returns false if it was already present
    pub fn insert(&mut self, id: &str) -> bool {
        self.insert_at(id, Instant::now())
    }

    fn contains_at(&self, id: &str, now: Instant) -> bool {
        self.seen
            .get(id)
            .is_some_and(|at| now.duration_since(*at) < self.window)
    }

    fn insert_at(&mut self, id: &str, now: Instant) -> bool {
        self.evict(now);
        if self.contains_at(id, now) {
            return false;
        }

        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        while self.seen.len() > self.capacity {
            self.pop_oldest();
        }
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some((_, at)) = self.order.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((id, at)) = self.order.pop_front() {
            // Only drop the map entry if it still belongs to this queue slot
            if self.seen.get(&id) == Some(&at) {
                self.seen.remove(&id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
