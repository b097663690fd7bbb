use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::protocol::sequence_greater_than;

const ACK_WINDOW: u32 = 32;
const MIN_RTO: Duration = Duration::from_millis(50);
const MAX_RTO: Duration = Duration::from_secs(2);

/// Smoothed round-trip estimator (RFC 6298 constants). Seeded from the first
/// sample so an idle localhost link does not inherit a pessimistic default.
#[derive(Debug, Default)]
pub struct RttEstimator {
    srtt: Option<f32>,
    rttvar: f32,
}

impl RttEstimator {
    const ALPHA: f32 = 0.125;
    const BETA: f32 = 0.25;

    pub fn observe(&mut self, sample_ms: f32) {
        match self.srtt {
            None => {
                self.srtt = Some(sample_ms);
                self.rttvar = sample_ms / 2.0;
            }
            Some(srtt) => {
                let diff = (sample_ms - srtt).abs();
                self.rttvar = (1.0 - Self::BETA) * self.rttvar + Self::BETA * diff;
                self.srtt = Some((1.0 - Self::ALPHA) * srtt + Self::ALPHA * sample_ms);
            }
        }
    }

    pub fn srtt_ms(&self) -> f32 {
        self.srtt.unwrap_or(100.0)
    }

    /// Retransmission timeout derived from the current estimate.
    pub fn rto(&self) -> Duration {
        let rto_ms = self.srtt_ms() + 4.0 * self.rttvar.max(1.0);
        Duration::from_millis(rto_ms as u64).clamp(MIN_RTO, MAX_RTO)
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    sequence: u32,
    send_time: Instant,
    acked: bool,
}

/// Send-side bookkeeping: which of our sequences the peer has acknowledged,
/// and what that tells us about the round trip.
#[derive(Debug)]
pub struct AckTracker {
    in_flight: VecDeque<InFlight>,
    max_in_flight: usize,
    rtt: RttEstimator,
}

impl AckTracker {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: VecDeque::with_capacity(max_in_flight),
            max_in_flight,
            rtt: RttEstimator::default(),
        }
    }

    pub fn track(&mut self, sequence: u32, now: Instant) {
        while self.in_flight.len() >= self.max_in_flight {
            self.in_flight.pop_front();
        }

        self.in_flight.push_back(InFlight {
            sequence,
            send_time: now,
            acked: false,
        });
    }

    /// Applies the peer's ack fields and returns the sequences newly
    /// acknowledged by them. An `ack` of 0 means the peer has received
    /// nothing yet and carries no information.
    pub fn process_ack(&mut self, ack: u32, ack_bitfield: u32, now: Instant) -> Vec<u32> {
        let mut acked = Vec::new();
        if ack == 0 {
            return acked;
        }

        for entry in &mut self.in_flight {
            if entry.acked {
                continue;
            }

            let is_acked = if entry.sequence == ack {
                true
            } else if sequence_greater_than(ack, entry.sequence) {
                let diff = ack.wrapping_sub(entry.sequence);
                diff <= ACK_WINDOW && (ack_bitfield & (1 << (diff - 1))) != 0
            } else {
                false
            };

            if is_acked {
                entry.acked = true;
                acked.push(entry.sequence);

                let sample = now.duration_since(entry.send_time).as_secs_f32() * 1000.0;
                self.rtt.observe(sample);
            }
        }

        while self.in_flight.front().is_some_and(|e| e.acked) {
            self.in_flight.pop_front();
        }

        acked
    }

    pub fn observe_rtt(&mut self, sample_ms: f32) {
        self.rtt.observe(sample_ms);
    }

    pub fn srtt_ms(&self) -> f32 {
        self.rtt.srtt_ms()
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn unacked_count(&self) -> usize {
        self.in_flight.iter().filter(|e| !e.acked).count()
    }
}

/// Receive-side bookkeeping: the newest sequence seen, the bitfield of the 32
/// preceding it, and duplicate suppression. Sequence 0 is never sent.
#[derive(Debug)]
pub struct ReceiveTracker {
    latest: u32,
    bitfield: u32,
    recent: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self {
            latest: 0,
            bitfield: 0,
            recent: VecDeque::with_capacity(128),
            max_recent: 128,
        }
    }

    /// Records a received sequence; returns false for duplicates.
    pub fn record(&mut self, sequence: u32) -> bool {
        if self.recent.contains(&sequence) {
            return false;
        }

        if self.recent.len() >= self.max_recent {
            self.recent.pop_front();
        }
        self.recent.push_back(sequence);

        if sequence_greater_than(sequence, self.latest) {
            let diff = sequence.wrapping_sub(self.latest);
            if diff <= ACK_WINDOW {
                self.bitfield = (self.bitfield << diff) | 1;
            } else {
                self.bitfield = 0;
            }
            self.latest = sequence;
        } else {
            let diff = self.latest.wrapping_sub(sequence);
            if diff > 0 && diff <= ACK_WINDOW {
                self.bitfield |= 1 << (diff - 1);
            }
        }

        true
    }

    /// The `(ack, ack_bitfield)` pair to stamp on outgoing headers.
    pub fn ack_fields(&self) -> (u32, u32) {
        (self.latest, self.bitfield)
    }
}
