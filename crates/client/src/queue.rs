use std::collections::VecDeque;

use biribit::Received;

const DEFAULT_CAPACITY: usize = 1024;

/// Bounded FIFO of room messages awaiting `pull_received`.
///
/// When full, the oldest unreliable entry is evicted to make room. Reliable
/// entries are never evicted and are admitted past capacity rather than
/// dropped, so a slow consumer can only lose unreliable traffic.
#[derive(Debug)]
pub struct ReceivedQueue {
    entries: VecDeque<Entry>,
    capacity: usize,
}

#[derive(Debug)]
struct Entry {
    message: Received,
    reliable: bool,
}

impl Default for ReceivedQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ReceivedQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, message: Received, reliable: bool) {
        if self.entries.len() >= self.capacity && !reliable && !self.evict_oldest_unreliable() {
            // Nothing evictable and the newcomer is droppable itself.
            return;
        }
        if self.entries.len() >= self.capacity && reliable {
            self.evict_oldest_unreliable();
        }

        self.entries.push_back(Entry { message, reliable });
    }

    pub fn pop(&mut self) -> Option<Received> {
        self.entries.pop_front().map(|entry| entry.message)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest_unreliable(&mut self) -> bool {
        match self.entries.iter().position(|entry| !entry.reliable) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }
}
