use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use biribit::types::{
    ClientId, ClientParameters, ConnectionId, Entry, Received, RemoteClient, Room, RoomId,
    ServerConnection, ServerInfo, UNASSIGNED,
};
use biribit::{DEFAULT_PORT, NetworkEndpoint, Reliability};

use crate::config::ClientConfig;
use crate::worker::{Command, SharedState, Worker};

/// Handle to the protocol engine.
///
/// All operations are asynchronous: they enqueue work for the network thread
/// and return immediately. Results surface through the revisioned getters and
/// `pull_received`; failures are logged, never returned.
pub struct Client {
    commands: Sender<Command>,
    shared: Arc<Mutex<SharedState>>,
    worker: Option<JoinHandle<()>>,
    empty_clients: Arc<Vec<RemoteClient>>,
    empty_rooms: Arc<Vec<Room>>,
}

impl Client {
    pub fn new() -> io::Result<Self> {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
        let shared = Arc::new(Mutex::new(SharedState::new(config.received_capacity)));
        let (commands, command_rx) = crossbeam_channel::unbounded();

        let worker = Worker::new(endpoint, config, command_rx, Arc::clone(&shared));
        let handle = std::thread::Builder::new()
            .name("biribit-net".into())
            .spawn(move || worker.run())?;

        Ok(Self {
            commands,
            shared,
            worker: Some(handle),
            empty_clients: Arc::new(Vec::new()),
            empty_rooms: Arc::new(Vec::new()),
        })
    }

    /// Begins connecting to `addr`. Port 0 means the protocol default.
    /// Progress shows up in `connections()` once the handshake completes.
    pub fn connect(&self, addr: &str, port: u16, password: Option<&str>) {
        let port = if port == 0 { DEFAULT_PORT } else { port };
        let _ = self.commands.send(Command::Connect {
            addr: addr.to_owned(),
            port,
            password: password.map(str::to_owned),
        });
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        let _ = self.commands.send(Command::Disconnect(connection));
    }

    pub fn disconnect_all(&self) {
        let _ = self.commands.send(Command::DisconnectAll);
    }

    /// Probes the local network for servers. Port 0 means the protocol
    /// default. Results accumulate in `discovered_servers()`.
    pub fn discover_on_lan(&self, port: u16) {
        let port = if port == 0 { DEFAULT_PORT } else { port };
        let _ = self.commands.send(Command::DiscoverOnLan { port });
    }

    pub fn refresh_discover(&self) {
        let _ = self.commands.send(Command::RefreshDiscover);
    }

    pub fn clear_discover(&self) {
        let _ = self.commands.send(Command::ClearDiscover);
    }

    pub fn set_local_client_parameters(
        &self,
        connection: ConnectionId,
        parameters: ClientParameters,
    ) {
        let _ = self.commands.send(Command::SetClientParameters {
            connection,
            parameters,
        });
    }

    pub fn refresh_rooms(&self, connection: ConnectionId) {
        let _ = self.commands.send(Command::RefreshRooms(connection));
    }

    /// Creates a room with `slot_count` slots, optionally joining the given
    /// slot of the new room in the same step.
    pub fn create_room(&self, connection: ConnectionId, slot_count: u32, join_slot: Option<u32>) {
        let _ = self.commands.send(Command::CreateRoom {
            connection,
            slot_count,
            join_slot,
        });
    }

    pub fn join_room(&self, connection: ConnectionId, room_id: RoomId, slot: Option<u32>) {
        let _ = self.commands.send(Command::JoinRoom {
            connection,
            room_id,
            slot,
        });
    }

    /// Joins any room with a free slot, creating one when none exists.
    pub fn join_random_or_create_room(&self, connection: ConnectionId, slot_count: u32) {
        let _ = self.commands.send(Command::JoinRandomOrCreate {
            connection,
            slot_count,
        });
    }

    pub fn leave_room(&self, connection: ConnectionId) {
        let _ = self.commands.send(Command::LeaveRoom(connection));
    }

    /// Sends `data` to every occupant of the joined room, including the
    /// sender, with the requested delivery guarantees.
    pub fn send_to_room(&self, connection: ConnectionId, data: Vec<u8>, mask: Reliability) {
        let _ = self.commands.send(Command::SendToRoom {
            connection,
            data,
            mask,
        });
    }

    /// Appends `data` to the joined room's journal. Unlike `send_to_room`,
    /// entries persist for the room's lifetime and are replayed to occupants
    /// who join later.
    pub fn send_entry(&self, connection: ConnectionId, data: Vec<u8>) {
        let _ = self.commands.send(Command::SendEntry { connection, data });
    }

    /// Established connections, with the revision of the snapshot.
    pub fn connections(&self) -> (u32, Arc<Vec<ServerConnection>>) {
        self.lock().connections.get()
    }

    /// Servers that answered discovery so far.
    pub fn discovered_servers(&self) -> (u32, Arc<Vec<ServerInfo>>) {
        self.lock().discovered.get()
    }

    /// Peers visible on a connection. Unknown connections yield revision 0
    /// and an empty list.
    pub fn remote_clients(&self, connection: ConnectionId) -> (u32, Arc<Vec<RemoteClient>>) {
        match self.lock().sessions.get(&connection) {
            Some(session) => session.remote_clients.get(),
            None => (0, Arc::clone(&self.empty_clients)),
        }
    }

    /// Rooms known on a connection, as of the last list push or refresh.
    pub fn rooms(&self, connection: ConnectionId) -> (u32, Arc<Vec<Room>>) {
        match self.lock().sessions.get(&connection) {
            Some(session) => session.rooms.get(),
            None => (0, Arc::clone(&self.empty_rooms)),
        }
    }

    /// Our client id on a connection, `UNASSIGNED` when unknown.
    pub fn local_client_id(&self, connection: ConnectionId) -> ClientId {
        self.lock()
            .sessions
            .get(&connection)
            .map(|session| session.local_client_id)
            .unwrap_or(UNASSIGNED)
    }

    /// The joined room on a connection, `UNASSIGNED` when not in any room.
    pub fn joined_room(&self, connection: ConnectionId) -> RoomId {
        self.lock()
            .sessions
            .get(&connection)
            .map(|session| session.joined_room)
            .unwrap_or(UNASSIGNED)
    }

    /// The occupied slot index; meaningful only while `joined_room` is set.
    pub fn joined_slot(&self, connection: ConnectionId) -> u32 {
        self.lock()
            .sessions
            .get(&connection)
            .map(|session| session.joined_slot)
            .unwrap_or(0)
    }

    /// How many journal entries of the joined room have synced so far.
    pub fn entries_count(&self, connection: ConnectionId) -> u32 {
        self.lock()
            .sessions
            .get(&connection)
            .map(|session| session.entries.len() as u32)
            .unwrap_or(0)
    }

    /// A synced journal entry by its 1-based id.
    pub fn entry(&self, connection: ConnectionId, entry_id: u32) -> Option<Entry> {
        self.lock().sessions.get(&connection).and_then(|session| {
            session
                .entries
                .get(entry_id.checked_sub(1)? as usize)
                .cloned()
        })
    }

    /// Takes the oldest queued room message, if any.
    pub fn pull_received(&self) -> Option<Received> {
        self.lock().received.pop()
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = Client::new().unwrap();

        let (revision, connections) = client.connections();
        assert_eq!(revision, 0);
        assert!(connections.is_empty());
        assert!(client.pull_received().is_none());
    }

    #[test]
    fn test_unknown_connection_getters_are_empty() {
        let client = Client::new().unwrap();

        let (_, clients) = client.remote_clients(42);
        assert!(clients.is_empty());
        assert_eq!(client.joined_room(42), UNASSIGNED);
        assert_eq!(client.local_client_id(42), UNASSIGNED);
    }
}
