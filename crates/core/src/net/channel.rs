use std::time::Instant;

use super::ordering::OrderedChannel;
use super::protocol::{Packet, PacketError, PacketHeader, PacketType, Reliability};
use super::resend::ResendQueue;
use super::tracking::{AckTracker, ReceiveTracker};

const MAX_IN_FLIGHT: usize = 256;

/// A payload released by the channel, tagged with the delivery guarantees
/// its sender requested. Relays reuse the tag when forwarding.
#[derive(Debug)]
pub struct Delivered {
    pub payload: PacketType,
    pub mask: Reliability,
}

/// Result of absorbing one incoming packet.
#[derive(Debug, Default)]
pub struct Absorbed {
    pub delivered: Vec<Delivered>,
    /// True when the packet was reliable and the sender expects its receipt
    /// acknowledged even if we have nothing else to say.
    pub wants_ack: bool,
}

/// Per-peer reliability state: sequencing, acknowledgment, retransmission
/// and ordered delivery for one bidirectional packet stream.
///
/// `frame` turns a payload into wire bytes, `absorb` turns incoming packets
/// into deliverable payloads. The owner is responsible for flushing
/// `resends_due` periodically and dropping the peer once `is_dead`.
#[derive(Debug)]
pub struct ReliableChannel {
    send_sequence: u32,
    order_sequence: u32,
    acks: AckTracker,
    receives: ReceiveTracker,
    resend: ResendQueue,
    ordered: OrderedChannel<Delivered>,
}

impl Default for ReliableChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableChannel {
    pub fn new() -> Self {
        Self {
            send_sequence: 1,
            order_sequence: 1,
            acks: AckTracker::new(MAX_IN_FLIGHT),
            receives: ReceiveTracker::new(),
            resend: ResendQueue::default(),
            ordered: OrderedChannel::default(),
        }
    }

    /// Serializes a payload with the next header for this stream. Reliable
    /// payloads are queued for retransmission until acknowledged.
    pub fn frame(
        &mut self,
        payload: PacketType,
        mask: Reliability,
        now: Instant,
    ) -> Result<Vec<u8>, PacketError> {
        let sequence = self.next_sequence();
        let order_seq = if mask.is_ordered() {
            self.next_order_sequence()
        } else {
            0
        };

        let (ack, ack_bitfield) = self.receives.ack_fields();
        let header = PacketHeader::new(sequence, ack, ack_bitfield).with_reliability(mask, order_seq);
        let bytes = Packet::new(header, payload).serialize()?;

        self.acks.track(sequence, now);
        if mask.is_reliable() {
            self.resend.track(sequence, bytes.clone(), now, self.acks.rto());
        }

        Ok(bytes)
    }

    /// Applies a packet's ack fields, suppresses duplicates, and routes
    /// ordered payloads through the hold buffer.
    pub fn absorb(&mut self, packet: Packet, now: Instant) -> Absorbed {
        let header = packet.header;
        let mask = header.reliability();

        let acked = self.acks.process_ack(header.ack, header.ack_bitfield, now);
        self.resend.mark_acked(&acked);

        // A refused hold-buffer entry must not be acked at all, so it is
        // turned away before the datagram is recorded.
        if mask.is_ordered()
            && mask.is_reliable()
            && !self.ordered.would_retain(header.order_seq)
        {
            return Absorbed::default();
        }

        if !self.receives.record(header.sequence) {
            // Duplicate datagram: the original ack may have been lost.
            return Absorbed {
                delivered: Vec::new(),
                wants_ack: mask.is_reliable(),
            };
        }

        if matches!(packet.payload, PacketType::Ack) {
            return Absorbed::default();
        }

        let delivered = if mask.is_ordered() {
            self.ordered
                .accept(
                    header.order_seq,
                    Delivered {
                        payload: packet.payload,
                        mask,
                    },
                    mask.is_reliable(),
                )
                .delivered
        } else {
            vec![Delivered {
                payload: packet.payload,
                mask,
            }]
        };

        Absorbed {
            delivered,
            wants_ack: mask.is_reliable(),
        }
    }

    /// Reliable packets whose retransmission timer has fired.
    pub fn resends_due(&mut self, now: Instant) -> Vec<Vec<u8>> {
        self.resend.due(now, self.acks.rto())
    }

    /// True once a reliable packet has exhausted its retries; the peer is
    /// unreachable and the connection should be torn down.
    pub fn is_dead(&self) -> bool {
        self.resend.is_exhausted()
    }

    pub fn rtt_ms(&self) -> f32 {
        self.acks.srtt_ms()
    }

    pub fn observe_rtt(&mut self, sample_ms: f32) {
        self.acks.observe_rtt(sample_ms);
    }

    pub fn pending_reliable(&self) -> usize {
        self.resend.len()
    }

    /// Abandons all retransmission state, used when disconnecting.
    pub fn clear(&mut self) {
        self.resend.clear();
    }

    fn next_sequence(&mut self) -> u32 {
        let seq = self.send_sequence;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        if self.send_sequence == 0 {
            self.send_sequence = 1;
        }
        seq
    }

    fn next_order_sequence(&mut self) -> u32 {
        let seq = self.order_sequence;
        self.order_sequence = self.order_sequence.wrapping_add(1);
        if self.order_sequence == 0 {
            self.order_sequence = 1;
        }
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pipe(bytes: &[u8]) -> Packet {
        Packet::deserialize(bytes).unwrap()
    }

    fn payload_data(delivered: &Delivered) -> &[u8] {
        match &delivered.payload {
            PacketType::RoomBroadcast { data } => data,
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn unreliable_payload_is_delivered_once() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new();
        let mut receiver = ReliableChannel::new();

        let bytes = sender
            .frame(
                PacketType::RoomBroadcast { data: vec![7] },
                Reliability::UNRELIABLE,
                now,
            )
            .unwrap();

        let absorbed = receiver.absorb(pipe(&bytes), now);
        assert_eq!(absorbed.delivered.len(), 1);
        assert!(!absorbed.wants_ack);
        assert_eq!(payload_data(&absorbed.delivered[0]), &[7]);
        assert!(sender.resends_due(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn reliable_payload_wants_ack_and_resends_until_acked() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new();
        let mut receiver = ReliableChannel::new();

        let bytes = sender
            .frame(
                PacketType::RoomBroadcast { data: vec![1] },
                Reliability::RELIABLE,
                now,
            )
            .unwrap();

        let absorbed = receiver.absorb(pipe(&bytes), now);
        assert!(absorbed.wants_ack);
        assert_eq!(sender.pending_reliable(), 1);

        // Unacked, so the packet comes due for retransmission.
        assert_eq!(sender.resends_due(now + Duration::from_secs(5)).len(), 1);

        // The receiver's ack rides back on its next frame.
        let ack_bytes = receiver
            .frame(PacketType::Ack, Reliability::UNRELIABLE, now)
            .unwrap();
        sender.absorb(pipe(&ack_bytes), now + Duration::from_millis(3));
        assert_eq!(sender.pending_reliable(), 0);
        assert!(sender.resends_due(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn duplicate_reliable_is_suppressed_but_still_wants_ack() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new();
        let mut receiver = ReliableChannel::new();

        let bytes = sender
            .frame(
                PacketType::RoomBroadcast { data: vec![1] },
                Reliability::RELIABLE,
                now,
            )
            .unwrap();

        assert_eq!(receiver.absorb(pipe(&bytes), now).delivered.len(), 1);

        // Retransmission of the same datagram: nothing delivered, but the
        // lost ack must be repaired.
        let dup = receiver.absorb(pipe(&bytes), now);
        assert!(dup.delivered.is_empty());
        assert!(dup.wants_ack);
    }

    #[test]
    fn ordered_payloads_come_out_in_send_order() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new();
        let mut receiver = ReliableChannel::new();

        let mask = Reliability::RELIABLE_ORDERED;
        let m1 = sender
            .frame(PacketType::RoomBroadcast { data: vec![1] }, mask, now)
            .unwrap();
        let m2 = sender
            .frame(PacketType::RoomBroadcast { data: vec![2] }, mask, now)
            .unwrap();
        let m3 = sender
            .frame(PacketType::RoomBroadcast { data: vec![3] }, mask, now)
            .unwrap();

        // m2 is delayed in the network; m3 arrives first and is held back.
        assert_eq!(receiver.absorb(pipe(&m1), now).delivered.len(), 1);
        assert!(receiver.absorb(pipe(&m3), now).delivered.is_empty());

        let released = receiver.absorb(pipe(&m2), now).delivered;
        assert_eq!(released.len(), 2);
        assert_eq!(payload_data(&released[0]), &[2]);
        assert_eq!(payload_data(&released[1]), &[3]);
    }

    #[test]
    fn unreliable_ordered_drops_stale() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new();
        let mut receiver = ReliableChannel::new();

        let mask = Reliability::ORDERED;
        let m1 = sender
            .frame(PacketType::RoomBroadcast { data: vec![1] }, mask, now)
            .unwrap();
        let m2 = sender
            .frame(PacketType::RoomBroadcast { data: vec![2] }, mask, now)
            .unwrap();
        let m3 = sender
            .frame(PacketType::RoomBroadcast { data: vec![3] }, mask, now)
            .unwrap();

        assert_eq!(receiver.absorb(pipe(&m1), now).delivered.len(), 1);
        assert_eq!(receiver.absorb(pipe(&m3), now).delivered.len(), 1);
        // m2 arrives after m3 was already delivered: dropped, never reordered.
        assert!(receiver.absorb(pipe(&m2), now).delivered.is_empty());
    }

    #[test]
    fn exhausted_retries_mark_channel_dead() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new();
        sender
            .frame(
                PacketType::RoomBroadcast { data: vec![1] },
                Reliability::RELIABLE,
                now,
            )
            .unwrap();

        let mut t = now;
        for _ in 0..16 {
            t += Duration::from_secs(8);
            sender.resends_due(t);
        }

        assert!(sender.is_dead());
    }

    #[test]
    fn ack_payload_is_consumed_internally() {
        let now = Instant::now();
        let mut sender = ReliableChannel::new();
        let mut receiver = ReliableChannel::new();

        let bytes = sender
            .frame(PacketType::Ack, Reliability::UNRELIABLE, now)
            .unwrap();
        let absorbed = receiver.absorb(pipe(&bytes), now);
        assert!(absorbed.delivered.is_empty());
        assert!(!absorbed.wants_ack);
    }
}
