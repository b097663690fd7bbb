use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const BACKOFF_CAP: Duration = Duration::from_secs(4);

#[derive(Debug, Clone)]
struct PendingReliable {
    sequence: u32,
    bytes: Vec<u8>,
    next_attempt: Instant,
    attempts: u32,
}

/// Serialized reliable packets awaiting acknowledgment.
///
/// Each entry is retransmitted on an exponential backoff schedule seeded
/// from the channel's current retransmission timeout. Exceeding the retry
/// ceiling marks the queue exhausted, which the owner treats as a dead
/// connection.
#[derive(Debug)]
pub struct ResendQueue {
    pending: VecDeque<PendingReliable>,
    max_attempts: u32,
    exhausted: bool,
}

impl Default for ResendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl ResendQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            max_attempts,
            exhausted: false,
        }
    }

    pub fn track(&mut self, sequence: u32, bytes: Vec<u8>, now: Instant, rto: Duration) {
        self.pending.push_back(PendingReliable {
            sequence,
            bytes,
            next_attempt: now + rto,
            attempts: 0,
        });
    }

    pub fn mark_acked(&mut self, sequences: &[u32]) {
        if sequences.is_empty() {
            return;
        }
        self.pending
            .retain(|entry| !sequences.contains(&entry.sequence));
    }

    /// Returns the packets due for retransmission, rescheduling each with a
    /// doubled interval.
    pub fn due(&mut self, now: Instant, rto: Duration) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        for entry in &mut self.pending {
            if entry.next_attempt > now {
                continue;
            }

            entry.attempts += 1;
            if entry.attempts >= self.max_attempts {
                self.exhausted = true;
            }

            let backoff = rto
                .saturating_mul(1u32 << entry.attempts.min(16))
                .min(BACKOFF_CAP);
            entry.next_attempt = now + backoff;
            out.push(entry.bytes.clone());
        }

        out
    }

    /// True once any entry has hit the retry ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Discards everything unacknowledged, cancelling the timers.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
