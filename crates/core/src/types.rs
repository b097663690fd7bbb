use rkyv::{Archive, Deserialize, Serialize};

pub type ConnectionId = u32;
pub type ClientId = u32;
pub type RoomId = u32;

/// Reserved id meaning "none": never assigned to a connection, client or room.
pub const UNASSIGNED: u32 = 0;

/// A server discovered on the LAN but not connected to. Replaced wholesale on
/// every discovery refresh; identified only by address and port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub addr: String,
    pub port: u16,
    pub ping: u32,
    pub password_protected: bool,
}

/// One logical session with a remote server, owned by its `Client`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConnection {
    pub id: ConnectionId,
    pub name: String,
    pub ping: u32,
}

/// A peer visible on one connection. `id` is unique within that connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct RemoteClient {
    pub id: ClientId,
    pub name: String,
    pub appid: String,
}

/// The local client's published identity on a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientParameters {
    pub name: String,
    pub appid: String,
}

impl ClientParameters {
    pub fn new(name: impl Into<String>, appid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            appid: appid.into(),
        }
    }
}

/// A server-side grouping of clients into fixed slots. The slot array length
/// is chosen at creation time and never changes; each entry holds either
/// `UNASSIGNED` or the occupant's client id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Room {
    pub id: RoomId,
    pub slots: Vec<ClientId>,
}

impl Room {
    pub fn new(id: RoomId, slot_count: u32) -> Self {
        Self {
            id,
            slots: vec![UNASSIGNED; slot_count as usize],
        }
    }

    pub fn free_slot(&self) -> Option<u32> {
        self.slots
            .iter()
            .position(|&occupant| occupant == UNASSIGNED)
            .map(|index| index as u32)
    }

    pub fn occupancy(&self) -> usize {
        self.slots
            .iter()
            .filter(|&&occupant| occupant != UNASSIGNED)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.occupancy() == 0
    }
}

/// One record in a room's journal. Entries are appended by occupants, kept
/// for the lifetime of the room, and numbered densely from 1 so clients can
/// tell what they are missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Entry {
    pub id: u32,
    pub from_slot: u8,
    pub data: Vec<u8>,
}

/// A message delivered from a room occupant, consumed exactly once via
/// `pull_received`.
#[derive(Debug, Clone)]
pub struct Received {
    /// Server timestamp, milliseconds since the unix epoch.
    pub when_ms: u64,
    pub connection: ConnectionId,
    pub room_id: RoomId,
    pub slot_id: u8,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_slots_fixed_at_creation() {
        let room = Room::new(7, 4);
        assert_eq!(room.slots.len(), 4);
        assert!(room.is_empty());
        assert_eq!(room.free_slot(), Some(0));
    }

    #[test]
    fn room_occupancy_counts_assigned_slots() {
        let mut room = Room::new(1, 3);
        room.slots[1] = 42;
        assert_eq!(room.occupancy(), 1);
        assert_eq!(room.free_slot(), Some(0));
        assert!(!room.is_empty());
    }
}
