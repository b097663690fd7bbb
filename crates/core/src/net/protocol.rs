use bitflags::bitflags;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::types::{Entry, RemoteClient, Room, RoomId};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x42495242;
pub const DEFAULT_PORT: u16 = 8287;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

bitflags! {
    /// Delivery guarantees attached to one message.
    ///
    /// Empty means fire-and-forget. `RELIABLE` retransmits until
    /// acknowledged, `ORDERED` sequences messages so the receiver never
    /// observes them out of send order.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Reliability: u8 {
        const RELIABLE = 1;
        const ORDERED = 2;
    }
}

impl Reliability {
    pub const UNRELIABLE: Self = Self::empty();
    pub const RELIABLE_ORDERED: Self = Self::RELIABLE.union(Self::ORDERED);

    pub fn is_reliable(self) -> bool {
        self.contains(Self::RELIABLE)
    }

    pub fn is_ordered(self) -> bool {
        self.contains(Self::ORDERED)
    }
}

/// Fixed framing preceding every payload.
///
/// `sequence` numbers every datagram on a connection, starting at 1; `ack`
/// and `ack_bitfield` acknowledge the newest received sequence and the 32
/// before it. `order_seq` is the ordered-channel position, 0 when the
/// message is not ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
    pub reliability: u8,
    pub order_seq: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
            reliability: Reliability::UNRELIABLE.bits(),
            order_seq: 0,
        }
    }

    pub fn with_reliability(mut self, mask: Reliability, order_seq: u32) -> Self {
        self.reliability = mask.bits();
        self.order_seq = order_seq;
        self
    }

    pub fn reliability(&self) -> Reliability {
        Reliability::from_bits_truncate(self.reliability)
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    ConnectionRequest {
        client_salt: u64,
        password: Option<String>,
    },
    ConnectionChallenge {
        server_salt: u64,
        challenge: u64,
    },
    ChallengeResponse {
        combined_salt: u64,
    },
    ConnectionAccepted {
        client_id: u32,
        server_name: String,
    },
    ConnectionDenied {
        reason: String,
    },
    Disconnect,
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    /// Carries nothing; exists so header ack fields reach the peer when no
    /// other traffic is flowing.
    Ack,
    DiscoverProbe,
    DiscoverResponse {
        name: String,
        password_protected: bool,
    },
    SetClientParameters {
        name: String,
        appid: String,
    },
    ClientList {
        clients: Vec<RemoteClient>,
    },
    RoomListRequest,
    RoomList {
        rooms: Vec<Room>,
    },
    RoomCreate {
        slot_count: u32,
        join_slot: Option<u32>,
    },
    RoomJoin {
        room_id: RoomId,
        slot: Option<u32>,
    },
    RoomJoinRandomOrCreate {
        slot_count: u32,
    },
    RoomLeave,
    /// Current room membership of the receiving client; `room_id` of
    /// `UNASSIGNED` means not joined anywhere.
    JoinStatus {
        room_id: RoomId,
        slot: u32,
    },
    RoomBroadcast {
        data: Vec<u8>,
    },
    BroadcastDelivery {
        when_ms: u64,
        room_id: RoomId,
        slot: u8,
        data: Vec<u8>,
    },
    /// Appends `data` to the journal of the sender's room.
    RoomEntrySubmit {
        data: Vec<u8>,
    },
    /// Asks for the journal entries of `room_id` with ids above `since`.
    RoomEntriesRequest {
        room_id: RoomId,
        since: u32,
    },
    /// Journal size of `room_id`, plus any entries the receiver asked for
    /// or the one just appended.
    RoomEntriesStatus {
        room_id: RoomId,
        count: u32,
        entries: Vec<Entry>,
    },
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(PacketError::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_comparison() {
        assert!(sequence_greater_than(2, 1));
        assert!(!sequence_greater_than(1, 2));
        assert!(sequence_greater_than(0, u32::MAX));
        assert!(!sequence_greater_than(u32::MAX, 0));
    }

    #[test]
    fn test_reliability_mask() {
        assert!(!Reliability::UNRELIABLE.is_reliable());
        assert!(!Reliability::UNRELIABLE.is_ordered());
        assert!(Reliability::RELIABLE_ORDERED.is_reliable());
        assert!(Reliability::RELIABLE_ORDERED.is_ordered());
        assert_eq!(Reliability::RELIABLE_ORDERED.bits(), 3);
    }

    #[test]
    fn test_header_round_trips_mask() {
        let header =
            PacketHeader::new(5, 3, 0b101).with_reliability(Reliability::RELIABLE_ORDERED, 9);
        assert_eq!(header.reliability(), Reliability::RELIABLE_ORDERED);
        assert_eq!(header.order_seq, 9);
        assert!(header.is_valid());
    }

    #[test]
    fn test_packet_serialization() {
        let header = PacketHeader::new(1, 0, 0);
        let payload = PacketType::RoomJoin {
            room_id: 4,
            slot: Some(2),
        };
        let packet = Packet::new(header, payload);

        let serialized = packet.serialize().unwrap();
        let deserialized = Packet::deserialize(&serialized).unwrap();

        assert_eq!(packet.header, deserialized.header);
        match deserialized.payload {
            PacketType::RoomJoin { room_id, slot } => {
                assert_eq!(room_id, 4);
                assert_eq!(slot, Some(2));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_broadcast_payload_round_trip() {
        let packet = Packet::new(
            PacketHeader::new(2, 1, 1).with_reliability(Reliability::RELIABLE, 0),
            PacketType::BroadcastDelivery {
                when_ms: 123456,
                room_id: 8,
                slot: 3,
                data: vec![1, 2, 3],
            },
        );

        let bytes = packet.serialize().unwrap();
        let decoded = Packet::deserialize(&bytes).unwrap();
        match decoded.payload {
            PacketType::BroadcastDelivery {
                when_ms,
                room_id,
                slot,
                data,
            } => {
                assert_eq!(when_ms, 123456);
                assert_eq!(room_id, 8);
                assert_eq!(slot, 3);
                assert_eq!(data, vec![1, 2, 3]);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
