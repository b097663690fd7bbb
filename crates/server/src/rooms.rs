use std::collections::HashMap;

use biribit::types::{ClientId, Entry, Room, RoomId, UNASSIGNED};

/// Slot indexes travel as a u8 in delivered messages.
const MAX_SLOTS: u32 = 256;

/// What `leave` did, for the caller's bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct LeaveOutcome {
    pub room_id: RoomId,
    pub destroyed: bool,
}

/// The room table and who occupies which slot.
///
/// A client occupies at most one slot across all rooms; joining elsewhere
/// implicitly leaves the current slot, but only after the new placement has
/// been fully validated. Rooms are destroyed when their last occupant leaves.
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: HashMap<RoomId, Room>,
    members: HashMap<ClientId, (RoomId, u32)>,
    journals: HashMap<RoomId, Vec<Entry>>,
    next_room_id: RoomId,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: HashMap::new(),
            members: HashMap::new(),
            journals: HashMap::new(),
            next_room_id: 1,
        }
    }

    pub fn create(&mut self, slot_count: u32) -> Result<RoomId, &'static str> {
        if slot_count == 0 {
            return Err("room needs at least one slot");
        }
        if slot_count > MAX_SLOTS {
            return Err("too many slots");
        }

        let room_id = self.next_room_id;
        self.next_room_id += 1;
        self.rooms.insert(room_id, Room::new(room_id, slot_count));
        self.journals.insert(room_id, Vec::new());
        Ok(room_id)
    }

    /// Places `client` into `room_id`, picking the first free slot unless one
    /// is requested. Nothing changes on failure, including any current
    /// membership of the client.
    pub fn join(
        &mut self,
        room_id: RoomId,
        client: ClientId,
        slot: Option<u32>,
    ) -> Result<u32, &'static str> {
        let room = self.rooms.get(&room_id).ok_or("no such room")?;

        let target = match slot {
            Some(index) => index,
            None => room.free_slot().ok_or("room is full")?,
        };
        let occupant = *room
            .slots
            .get(target as usize)
            .ok_or("no such slot")?;
        if occupant == client {
            return Ok(target);
        }
        if occupant != UNASSIGNED {
            return Err("slot is occupied");
        }

        // Validated; move the client. A move within the same room frees the
        // old slot directly so the room is never momentarily empty.
        match self.members.get(&client).copied() {
            Some((current_room, current_slot)) if current_room == room_id => {
                if let Some(room) = self.rooms.get_mut(&room_id) {
                    if let Some(entry) = room.slots.get_mut(current_slot as usize) {
                        *entry = UNASSIGNED;
                    }
                }
            }
            Some(_) => {
                self.leave(client);
            }
            None => {}
        }
        if let Some(room) = self.rooms.get_mut(&room_id) {
            room.slots[target as usize] = client;
        }
        self.members.insert(client, (room_id, target));
        Ok(target)
    }

    /// Joins the lowest-id room with a free slot, creating a fresh room with
    /// `slot_count` slots when every room is full.
    pub fn join_random_or_create(
        &mut self,
        client: ClientId,
        slot_count: u32,
    ) -> Result<(RoomId, u32), &'static str> {
        let mut candidates: Vec<RoomId> = self
            .rooms
            .values()
            .filter(|room| room.free_slot().is_some())
            .map(|room| room.id)
            .collect();
        candidates.sort_unstable();

        let room_id = match candidates.first() {
            Some(&id) => id,
            None => self.create(slot_count)?,
        };

        // Already placed in the chosen room: keep the current slot.
        if let Some((current_room, current_slot)) = self.membership(client) {
            if current_room == room_id {
                return Ok((current_room, current_slot));
            }
        }

        let slot = self.join(room_id, client, None)?;
        Ok((room_id, slot))
    }

    /// Removes the client from its room, if any. Empty rooms are destroyed.
    pub fn leave(&mut self, client: ClientId) -> Option<LeaveOutcome> {
        let (room_id, slot) = self.members.remove(&client)?;

        let destroyed = match self.rooms.get_mut(&room_id) {
            Some(room) => {
                if let Some(entry) = room.slots.get_mut(slot as usize) {
                    *entry = UNASSIGNED;
                }
                room.is_empty()
            }
            None => false,
        };
        if destroyed {
            self.rooms.remove(&room_id);
            self.journals.remove(&room_id);
        }

        Some(LeaveOutcome { room_id, destroyed })
    }

    /// Appends to the room's journal, assigning the next 1-based entry id.
    pub fn append_entry(&mut self, room_id: RoomId, from_slot: u8, data: Vec<u8>) -> Option<Entry> {
        let journal = self.journals.get_mut(&room_id)?;
        let entry = Entry {
            id: journal.len() as u32 + 1,
            from_slot,
            data,
        };
        journal.push(entry.clone());
        Some(entry)
    }

    pub fn entry_count(&self, room_id: RoomId) -> u32 {
        self.journals
            .get(&room_id)
            .map(|journal| journal.len() as u32)
            .unwrap_or(0)
    }

    /// Journal entries with ids above `since`, oldest first.
    pub fn entries_after(&self, room_id: RoomId, since: u32) -> Vec<Entry> {
        self.journals
            .get(&room_id)
            .map(|journal| journal.iter().skip(since as usize).cloned().collect())
            .unwrap_or_default()
    }

    pub fn membership(&self, client: ClientId) -> Option<(RoomId, u32)> {
        self.members.get(&client).copied()
    }

    pub fn occupants(&self, room_id: RoomId) -> Vec<ClientId> {
        self.rooms
            .get(&room_id)
            .map(|room| {
                room.slots
                    .iter()
                    .copied()
                    .filter(|&occupant| occupant != UNASSIGNED)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All rooms sorted by id, as pushed to clients.
    pub fn list(&self) -> Vec<Room> {
        let mut rooms: Vec<Room> = self.rooms.values().cloned().collect();
        rooms.sort_by_key(|room| room.id);
        rooms
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
