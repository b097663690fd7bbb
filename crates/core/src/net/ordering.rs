use std::collections::HashMap;

use super::protocol::sequence_greater_than;

const DEFAULT_MAX_HELD: usize = 256;

/// Outcome of feeding one ordered message to the channel.
#[derive(Debug)]
pub struct Acceptance<T> {
    /// Messages now deliverable, in send order.
    pub delivered: Vec<T>,
    /// False when a reliable message had to be turned away because the hold
    /// buffer is full; the sender must not be acknowledged for it.
    pub retained: bool,
}

/// Receive-side sequencing for the `ORDERED` reliability bit.
///
/// Ordered sequences start at 1 and increase per message. Reliable-ordered
/// gaps are held back until retransmission fills them; unreliable-ordered
/// messages are delivered immediately, with anything older than the newest
/// delivered message dropped.
#[derive(Debug)]
pub struct OrderedChannel<T> {
    next_expected: u32,
    held: HashMap<u32, T>,
    max_held: usize,
}

impl<T> Default for OrderedChannel<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HELD)
    }
}

impl<T> OrderedChannel<T> {
    pub fn new(max_held: usize) -> Self {
        Self {
            next_expected: 1,
            held: HashMap::new(),
            max_held,
        }
    }

    pub fn accept(&mut self, order_seq: u32, value: T, reliable: bool) -> Acceptance<T> {
        if reliable {
            self.accept_reliable(order_seq, value)
        } else {
            self.accept_unreliable(order_seq, value)
        }
    }

    fn accept_reliable(&mut self, order_seq: u32, value: T) -> Acceptance<T> {
        if sequence_greater_than(self.next_expected, order_seq) {
            // Already delivered; a retransmission beat the ack.
            return Acceptance {
                delivered: Vec::new(),
                retained: true,
            };
        }

        if order_seq != self.next_expected {
            if self.held.contains_key(&order_seq) {
                return Acceptance {
                    delivered: Vec::new(),
                    retained: true,
                };
            }
            // Held entries were already acknowledged and will never be
            // retransmitted; a full buffer refuses the newcomer instead.
            if self.held.len() >= self.max_held {
                return Acceptance {
                    delivered: Vec::new(),
                    retained: false,
                };
            }
            self.held.insert(order_seq, value);
            return Acceptance {
                delivered: Vec::new(),
                retained: true,
            };
        }

        let mut delivered = vec![value];
        self.next_expected = self.next_expected.wrapping_add(1);
        while let Some(held) = self.held.remove(&self.next_expected) {
            delivered.push(held);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
        Acceptance {
            delivered,
            retained: true,
        }
    }

    fn accept_unreliable(&mut self, order_seq: u32, value: T) -> Acceptance<T> {
        if sequence_greater_than(self.next_expected, order_seq) {
            // A newer message was already delivered; drop the late one.
            return Acceptance {
                delivered: Vec::new(),
                retained: true,
            };
        }

        self.next_expected = order_seq.wrapping_add(1);
        self.held
            .retain(|&seq, _| sequence_greater_than(seq, order_seq));
        Acceptance {
            delivered: vec![value],
            retained: true,
        }
    }

    /// Whether `accept` would keep this sequence rather than refuse it.
    /// Lets the caller skip datagram bookkeeping for refusals.
    pub fn would_retain(&self, order_seq: u32) -> bool {
        sequence_greater_than(self.next_expected, order_seq)
            || order_seq == self.next_expected
            || self.held.contains_key(&order_seq)
            || self.held.len() < self.max_held
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_gap_is_buffered_until_filled() {
        let mut channel = OrderedChannel::new(64);

        assert_eq!(channel.accept(1, "m1", true).delivered, vec!["m1"]);
        // m2 delayed in transit; m3 arrives first and is held.
        let out = channel.accept(3, "m3", true);
        assert!(out.delivered.is_empty());
        assert!(out.retained);
        assert_eq!(channel.held_count(), 1);
        // m2 arrives late and releases m3 with it, preserving send order.
        assert_eq!(channel.accept(2, "m2", true).delivered, vec!["m2", "m3"]);
        assert_eq!(channel.held_count(), 0);
    }

    #[test]
    fn reliable_duplicate_is_dropped_but_acked() {
        let mut channel = OrderedChannel::new(64);

        assert_eq!(channel.accept(1, 1, true).delivered, vec![1]);
        let dup = channel.accept(1, 1, true);
        assert!(dup.delivered.is_empty());
        assert!(dup.retained);
    }

    #[test]
    fn unreliable_stale_is_dropped() {
        let mut channel = OrderedChannel::new(64);

        assert_eq!(channel.accept(1, "m1", false).delivered, vec!["m1"]);
        assert_eq!(channel.accept(3, "m3", false).delivered, vec!["m3"]);
        // m2 shows up after m3 was delivered: too late.
        assert!(channel.accept(2, "m2", false).delivered.is_empty());
        assert_eq!(channel.accept(4, "m4", false).delivered, vec!["m4"]);
    }

    #[test]
    fn full_hold_buffer_refuses_without_ack() {
        let mut channel = OrderedChannel::new(2);

        assert!(channel.accept(3, 3, true).retained);
        assert!(channel.accept(4, 4, true).retained);
        // Farthest-ahead incoming is refused so the sender retransmits it.
        assert!(!channel.accept(5, 5, true).retained);
        assert_eq!(channel.held_count(), 2);

        // The stream still recovers once the gap fills.
        assert_eq!(channel.accept(1, 1, true).delivered, vec![1]);
        assert_eq!(channel.accept(2, 2, true).delivered, vec![2, 3, 4]);
    }

    #[test]
    fn full_hold_buffer_never_trades_away_held_entries() {
        let mut channel = OrderedChannel::new(2);

        // 3 and 4 were acknowledged on receipt; the sender will never
        // retransmit them, so they must survive any later arrival.
        assert!(channel.accept(3, 3, true).retained);
        assert!(channel.accept(4, 4, true).retained);
        assert!(!channel.accept(2, 2, true).retained);
        assert_eq!(channel.held_count(), 2);

        // The refused 2 was not acked, so its retransmission completes
        // the stream with nothing lost.
        assert_eq!(channel.accept(1, 1, true).delivered, vec![1]);
        assert_eq!(channel.accept(2, 2, true).delivered, vec![2, 3, 4]);
        assert_eq!(channel.accept(5, 5, true).delivered, vec![5]);
    }
}
