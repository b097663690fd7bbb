use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};

use biribit::types::{
    ClientId, ClientParameters, ConnectionId, Entry, Received, RemoteClient, Room, RoomId,
    ServerConnection, ServerInfo, UNASSIGNED,
};
use biribit::{
    Delivered, NetworkEndpoint, Packet, PacketHeader, PacketType, Reliability, Revisioned,
};

use crate::config::ClientConfig;
use crate::connection::{LinkState, ServerLink, epoch_ms};
use crate::discover::DiscoverRegistry;
use crate::queue::ReceivedQueue;

/// Requests from the owning `Client` to its network thread.
#[derive(Debug)]
pub(crate) enum Command {
    Connect {
        addr: String,
        port: u16,
        password: Option<String>,
    },
    Disconnect(ConnectionId),
    DisconnectAll,
    DiscoverOnLan {
        port: u16,
    },
    RefreshDiscover,
    ClearDiscover,
    SetClientParameters {
        connection: ConnectionId,
        parameters: ClientParameters,
    },
    RefreshRooms(ConnectionId),
    CreateRoom {
        connection: ConnectionId,
        slot_count: u32,
        join_slot: Option<u32>,
    },
    JoinRoom {
        connection: ConnectionId,
        room_id: RoomId,
        slot: Option<u32>,
    },
    JoinRandomOrCreate {
        connection: ConnectionId,
        slot_count: u32,
    },
    LeaveRoom(ConnectionId),
    SendToRoom {
        connection: ConnectionId,
        data: Vec<u8>,
        mask: Reliability,
    },
    SendEntry {
        connection: ConnectionId,
        data: Vec<u8>,
    },
    Shutdown,
}

/// Per-connection state mirrored for the owning `Client` to read.
#[derive(Debug, Default)]
pub(crate) struct SessionShared {
    pub remote_clients: Revisioned<Vec<RemoteClient>>,
    pub rooms: Revisioned<Vec<Room>>,
    pub local_client_id: ClientId,
    pub joined_room: RoomId,
    pub joined_slot: u32,
    /// Journal of the joined room, synced in id order.
    pub entries: Vec<Entry>,
}

/// Everything the `Client` facade reads, updated by the network thread.
#[derive(Debug)]
pub(crate) struct SharedState {
    pub connections: Revisioned<Vec<ServerConnection>>,
    pub discovered: Revisioned<Vec<ServerInfo>>,
    pub sessions: HashMap<ConnectionId, SessionShared>,
    pub received: ReceivedQueue,
}

impl SharedState {
    pub fn new(received_capacity: usize) -> Self {
        Self {
            connections: Revisioned::default(),
            discovered: Revisioned::default(),
            sessions: HashMap::new(),
            received: ReceivedQueue::new(received_capacity),
        }
    }
}

/// The network thread: owns the socket and all per-server links, and is the
/// only writer of `SharedState`.
pub(crate) struct Worker {
    endpoint: NetworkEndpoint,
    config: ClientConfig,
    commands: Receiver<Command>,
    shared: Arc<Mutex<SharedState>>,
    links: HashMap<SocketAddr, ServerLink>,
    next_connection_id: ConnectionId,
    discover: DiscoverRegistry,
    discover_port: u16,
    broadcast_enabled: bool,
    shutdown: bool,
}

impl Worker {
    pub fn new(
        endpoint: NetworkEndpoint,
        config: ClientConfig,
        commands: Receiver<Command>,
        shared: Arc<Mutex<SharedState>>,
    ) -> Self {
        Self {
            endpoint,
            config,
            commands,
            shared,
            links: HashMap::new(),
            next_connection_id: 1,
            discover: DiscoverRegistry::default(),
            discover_port: 0,
            broadcast_enabled: false,
            shutdown: false,
        }
    }

    pub fn run(mut self) {
        while !self.shutdown {
            self.drain_commands();
            if self.shutdown {
                break;
            }
            self.process_network();
            self.tick_links();
            thread::sleep(Duration::from_millis(1));
        }

        // Best-effort goodbyes; the sockets close right after.
        let addrs: Vec<SocketAddr> = self.links.keys().copied().collect();
        for addr in addrs {
            self.disconnect_link(addr);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_commands(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.shutdown = true;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                addr,
                port,
                password,
            } => self.connect(&addr, port, password),
            Command::Disconnect(id) => {
                if let Some(addr) = self.addr_of(id) {
                    self.disconnect_link(addr);
                }
            }
            Command::DisconnectAll => {
                let addrs: Vec<SocketAddr> = self.links.keys().copied().collect();
                for addr in addrs {
                    self.disconnect_link(addr);
                }
            }
            Command::DiscoverOnLan { port } => {
                self.discover_port = port;
                self.send_probe_broadcast();
            }
            Command::RefreshDiscover => {
                self.discover.begin_probe(Instant::now());
                let probe = probe_packet();
                for addr in self.discover.known_addrs() {
                    if let Err(e) = self.endpoint.send_to(&probe, addr) {
                        log::debug!("discover refresh to {} failed: {}", addr, e);
                    }
                }
                if self.discover_port != 0 {
                    self.send_probe_broadcast();
                }
            }
            Command::ClearDiscover => {
                self.discover.clear();
                self.lock().discovered.replace_if_changed(Vec::new());
            }
            Command::SetClientParameters {
                connection,
                parameters,
            } => self.set_client_parameters(connection, parameters),
            Command::RefreshRooms(id) => {
                if let Some(addr) = self.addr_of(id) {
                    self.send_to_link(addr, PacketType::RoomListRequest, Reliability::RELIABLE);
                }
            }
            Command::CreateRoom {
                connection,
                slot_count,
                join_slot,
            } => {
                if let Some(addr) = self.addr_of(connection) {
                    self.send_to_link(
                        addr,
                        PacketType::RoomCreate {
                            slot_count,
                            join_slot,
                        },
                        Reliability::RELIABLE_ORDERED,
                    );
                }
            }
            Command::JoinRoom {
                connection,
                room_id,
                slot,
            } => {
                if let Some(addr) = self.addr_of(connection) {
                    self.send_to_link(
                        addr,
                        PacketType::RoomJoin { room_id, slot },
                        Reliability::RELIABLE_ORDERED,
                    );
                }
            }
            Command::JoinRandomOrCreate {
                connection,
                slot_count,
            } => {
                if let Some(addr) = self.addr_of(connection) {
                    self.send_to_link(
                        addr,
                        PacketType::RoomJoinRandomOrCreate { slot_count },
                        Reliability::RELIABLE_ORDERED,
                    );
                }
            }
            Command::LeaveRoom(id) => {
                if let Some(addr) = self.addr_of(id) {
                    self.send_to_link(addr, PacketType::RoomLeave, Reliability::RELIABLE_ORDERED);
                }
            }
            Command::SendToRoom {
                connection,
                data,
                mask,
            } => self.send_to_room(connection, data, mask),
            Command::SendEntry { connection, data } => self.send_entry(connection, data),
            Command::Shutdown => self.shutdown = true,
        }
    }

    fn connect(&mut self, host: &str, port: u16, password: Option<String>) {
        let addr = match (host, port).to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    log::warn!("{}:{} resolved to no addresses", host, port);
                    return;
                }
            },
            Err(e) => {
                log::warn!("failed to resolve {}:{}: {}", host, port, e);
                return;
            }
        };

        if self.links.contains_key(&addr) {
            log::debug!("already connecting or connected to {}", addr);
            return;
        }

        log::info!("connecting to {}", addr);
        let now = Instant::now();
        let link = ServerLink::new(addr, password, now);
        self.links.insert(addr, link);
        self.send_connection_request(addr);
    }

    fn send_connection_request(&mut self, addr: SocketAddr) {
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        let payload = PacketType::ConnectionRequest {
            client_salt: link.client_salt,
            password: link.password.clone(),
        };
        self.send_to_link(addr, payload, Reliability::UNRELIABLE);
    }

    fn disconnect_link(&mut self, addr: SocketAddr) {
        if self
            .links
            .get(&addr)
            .is_some_and(|link| link.is_connected())
        {
            self.send_to_link(addr, PacketType::Disconnect, Reliability::UNRELIABLE);
        }
        self.remove_link(addr, "disconnected");
    }

    fn remove_link(&mut self, addr: SocketAddr, reason: &str) {
        let Some(link) = self.links.remove(&addr) else {
            return;
        };

        if link.is_connected() {
            log::info!("connection {} to {} closed: {}", link.id, addr, reason);
            self.lock().sessions.remove(&link.id);
        } else {
            log::warn!("connection attempt to {} abandoned: {}", addr, reason);
        }
        self.publish_connections();
    }

    fn set_client_parameters(&mut self, id: ConnectionId, parameters: ClientParameters) {
        let Some(addr) = self.addr_of(id) else {
            return;
        };
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        // Re-announcing the same identity produces no traffic.
        if link.announced_parameters.as_ref() == Some(&parameters) {
            return;
        }
        link.announced_parameters = Some(parameters.clone());
        self.send_to_link(
            addr,
            PacketType::SetClientParameters {
                name: parameters.name,
                appid: parameters.appid,
            },
            Reliability::RELIABLE_ORDERED,
        );
    }

    fn send_to_room(&mut self, id: ConnectionId, data: Vec<u8>, mask: Reliability) {
        let Some(addr) = self.addr_of(id) else {
            log::warn!("send on unknown connection {}", id);
            return;
        };
        let joined = self
            .links
            .get(&addr)
            .is_some_and(|link| link.joined_room != UNASSIGNED);
        if !joined {
            log::warn!("connection {} is not in a room, message dropped", id);
            return;
        }
        self.send_to_link(addr, PacketType::RoomBroadcast { data }, mask);
    }

    fn send_entry(&mut self, id: ConnectionId, data: Vec<u8>) {
        let Some(addr) = self.addr_of(id) else {
            log::warn!("send on unknown connection {}", id);
            return;
        };
        let joined = self
            .links
            .get(&addr)
            .is_some_and(|link| link.joined_room != UNASSIGNED);
        if !joined {
            log::warn!("connection {} is not in a room, entry dropped", id);
            return;
        }
        self.send_to_link(addr, PacketType::RoomEntrySubmit { data }, Reliability::RELIABLE);
    }

    fn send_probe_broadcast(&mut self) {
        if self.discover_port == 0 {
            return;
        }
        if !self.broadcast_enabled {
            if let Err(e) = self.endpoint.enable_broadcast() {
                log::warn!("failed to enable broadcast: {}", e);
                return;
            }
            self.broadcast_enabled = true;
        }

        self.discover.begin_probe(Instant::now());
        if let Err(e) = self.endpoint.broadcast(&probe_packet(), self.discover_port) {
            log::debug!("discovery broadcast failed: {}", e);
        }
    }

    fn send_to_link(&mut self, addr: SocketAddr, payload: PacketType, mask: Reliability) {
        let now = Instant::now();
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        match link.channel.frame(payload, mask, now) {
            Ok(bytes) => {
                if let Err(e) = self.endpoint.send_bytes(&bytes, addr) {
                    log::warn!("send to {} failed: {}", addr, e);
                }
            }
            Err(e) => log::warn!("failed to frame packet for {}: {}", addr, e),
        }
    }

    fn process_network(&mut self) {
        let packets = match self.endpoint.receive() {
            Ok(packets) => packets,
            Err(e) => {
                log::warn!("receive failed: {}", e);
                return;
            }
        };

        let now = Instant::now();
        for (packet, addr) in packets {
            if let PacketType::DiscoverResponse {
                name,
                password_protected,
            } = &packet.payload
            {
                self.discover
                    .observe(addr, name.clone(), *password_protected, now);
                let snapshot = self.discover.snapshot();
                self.lock().discovered.replace_if_changed(snapshot);
                continue;
            }

            let Some(link) = self.links.get_mut(&addr) else {
                continue;
            };
            link.last_receive = now;

            let absorbed = link.channel.absorb(packet, now);
            for delivered in absorbed.delivered {
                self.handle_payload(addr, delivered);
            }
            if absorbed.wants_ack {
                self.send_to_link(addr, PacketType::Ack, Reliability::UNRELIABLE);
            }
        }
    }

    fn handle_payload(&mut self, addr: SocketAddr, delivered: Delivered) {
        let Delivered { payload, mask } = delivered;
        match payload {
            PacketType::ConnectionChallenge {
                server_salt,
                challenge,
            } => self.handle_challenge(addr, server_salt, challenge),
            PacketType::ConnectionAccepted {
                client_id,
                server_name,
            } => self.handle_accepted(addr, client_id, server_name),
            PacketType::ConnectionDenied { reason } => {
                log::warn!("connection to {} denied: {}", addr, reason);
                self.remove_link(addr, "denied by server");
            }
            PacketType::Disconnect => {
                self.remove_link(addr, "closed by server");
            }
            PacketType::Ping { timestamp } => {
                self.send_to_link(
                    addr,
                    PacketType::Pong { timestamp },
                    Reliability::UNRELIABLE,
                );
            }
            PacketType::Pong { timestamp } => self.handle_pong(addr, timestamp),
            PacketType::ClientList { clients } => {
                if let Some(id) = self.connected_id(addr) {
                    let mut shared = self.lock();
                    if let Some(session) = shared.sessions.get_mut(&id) {
                        session.remote_clients.replace_if_changed(clients);
                    }
                }
            }
            PacketType::RoomList { rooms } => {
                if let Some(id) = self.connected_id(addr) {
                    let mut shared = self.lock();
                    if let Some(session) = shared.sessions.get_mut(&id) {
                        session.rooms.replace_if_changed(rooms);
                    }
                }
            }
            PacketType::JoinStatus { room_id, slot } => self.handle_join_status(addr, room_id, slot),
            PacketType::RoomEntriesStatus {
                room_id,
                count,
                entries,
            } => self.handle_entries_status(addr, room_id, count, entries),
            PacketType::BroadcastDelivery {
                when_ms,
                room_id,
                slot,
                data,
            } => {
                if let Some(id) = self.connected_id(addr) {
                    let message = Received {
                        when_ms,
                        connection: id,
                        room_id,
                        slot_id: slot,
                        data,
                    };
                    self.lock().received.push(message, mask.is_reliable());
                }
            }
            _ => {}
        }
    }

    fn handle_challenge(&mut self, addr: SocketAddr, server_salt: u64, challenge: u64) {
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        if link.state != LinkState::Requesting {
            return;
        }

        let expected = link.client_salt ^ server_salt;
        if challenge != expected {
            log::warn!("challenge mismatch from {}", addr);
            return;
        }

        link.server_salt = server_salt;
        link.state = LinkState::AwaitingAccept;
        self.send_to_link(
            addr,
            PacketType::ChallengeResponse {
                combined_salt: expected,
            },
            Reliability::RELIABLE,
        );
    }

    fn handle_accepted(&mut self, addr: SocketAddr, client_id: ClientId, server_name: String) {
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        if link.is_connected() {
            return;
        }

        link.id = self.next_connection_id;
        self.next_connection_id = self.next_connection_id.wrapping_add(1).max(1);
        link.state = LinkState::Connected;
        link.server_name = server_name;
        link.local_client_id = client_id;

        log::info!(
            "connected to \"{}\" at {} as client {} (connection {})",
            link.server_name,
            addr,
            client_id,
            link.id
        );

        let id = link.id;
        let pending = link.announced_parameters.clone();

        self.lock().sessions.insert(
            id,
            SessionShared {
                local_client_id: client_id,
                ..SessionShared::default()
            },
        );
        self.publish_connections();

        if let Some(parameters) = pending {
            self.send_to_link(
                addr,
                PacketType::SetClientParameters {
                    name: parameters.name,
                    appid: parameters.appid,
                },
                Reliability::RELIABLE_ORDERED,
            );
        }
        self.send_to_link(addr, PacketType::RoomListRequest, Reliability::RELIABLE);
    }

    fn handle_pong(&mut self, addr: SocketAddr, timestamp: u64) {
        let rtt = epoch_ms().saturating_sub(timestamp);
        if let Some(link) = self.links.get_mut(&addr) {
            link.channel.observe_rtt(rtt as f32);
        }
        self.publish_connections();
    }

    fn handle_join_status(&mut self, addr: SocketAddr, room_id: RoomId, slot: u32) {
        let Some(link) = self.links.get_mut(&addr) else {
            return;
        };
        if !link.is_connected() {
            return;
        }
        let room_changed = link.joined_room != room_id;
        link.joined_room = room_id;
        link.joined_slot = slot;
        if room_changed {
            link.entries_requested = 0;
        }

        let id = link.id;
        let mut shared = self.lock();
        if let Some(session) = shared.sessions.get_mut(&id) {
            session.joined_room = room_id;
            session.joined_slot = slot;
            // The journal belongs to the room that was left behind.
            if room_changed {
                session.entries.clear();
            }
        }
    }

    /// Applies a journal sync: appends entries in id order and asks once for
    /// anything the server has that we have not seen.
    fn handle_entries_status(
        &mut self,
        addr: SocketAddr,
        room_id: RoomId,
        count: u32,
        entries: Vec<Entry>,
    ) {
        let (id, requested) = match self.links.get(&addr) {
            Some(link) if link.is_connected() && link.joined_room == room_id => {
                (link.id, link.entries_requested)
            }
            _ => return,
        };

        let synced = {
            let mut shared = self.lock();
            let Some(session) = shared.sessions.get_mut(&id) else {
                return;
            };
            for entry in entries {
                if entry.id as usize == session.entries.len() + 1 {
                    session.entries.push(entry);
                }
            }
            session.entries.len() as u32
        };

        if count > synced && count > requested {
            if let Some(link) = self.links.get_mut(&addr) {
                link.entries_requested = count;
            }
            self.send_to_link(
                addr,
                PacketType::RoomEntriesRequest {
                    room_id,
                    since: synced,
                },
                Reliability::RELIABLE,
            );
        }
    }

    fn tick_links(&mut self) {
        let now = Instant::now();
        let mut outgoing: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut expired: Vec<(SocketAddr, &'static str)> = Vec::new();
        let mut request_resends: Vec<SocketAddr> = Vec::new();

        for link in self.links.values_mut() {
            match link.state {
                LinkState::Requesting | LinkState::AwaitingAccept => {
                    if now.duration_since(link.started_at) > self.config.connect_timeout {
                        expired.push((link.addr, "handshake timed out"));
                        continue;
                    }
                    if link.state == LinkState::Requesting
                        && now.duration_since(link.last_handshake_send)
                            >= self.config.handshake_resend
                    {
                        link.last_handshake_send = now;
                        request_resends.push(link.addr);
                    }
                }
                LinkState::Connected => {
                    if now.duration_since(link.last_receive) > self.config.connection_timeout {
                        expired.push((link.addr, "timed out"));
                        continue;
                    }
                    if now.duration_since(link.last_ping) >= self.config.ping_interval {
                        link.last_ping = now;
                        let ping = PacketType::Ping {
                            timestamp: epoch_ms(),
                        };
                        match link.channel.frame(ping, Reliability::UNRELIABLE, now) {
                            Ok(bytes) => outgoing.push((link.addr, bytes)),
                            Err(e) => log::warn!("failed to frame ping: {}", e),
                        }
                    }
                }
            }

            for bytes in link.channel.resends_due(now) {
                outgoing.push((link.addr, bytes));
            }
            if link.channel.is_dead() {
                expired.push((link.addr, "too many retransmissions"));
            }
        }

        for addr in request_resends {
            self.send_connection_request(addr);
        }
        for (addr, bytes) in outgoing {
            if let Err(e) = self.endpoint.send_bytes(&bytes, addr) {
                log::warn!("send to {} failed: {}", addr, e);
            }
        }
        for (addr, reason) in expired {
            self.remove_link(addr, reason);
        }
    }

    fn publish_connections(&mut self) {
        let mut connections: Vec<ServerConnection> = self
            .links
            .values()
            .filter(|link| link.is_connected())
            .map(|link| ServerConnection {
                id: link.id,
                name: link.server_name.clone(),
                ping: link.channel.rtt_ms() as u32,
            })
            .collect();
        connections.sort_by_key(|connection| connection.id);
        self.lock().connections.replace_if_changed(connections);
    }

    fn addr_of(&self, id: ConnectionId) -> Option<SocketAddr> {
        self.links
            .values()
            .find(|link| link.is_connected() && link.id == id)
            .map(|link| link.addr)
    }

    fn connected_id(&self, addr: SocketAddr) -> Option<ConnectionId> {
        self.links
            .get(&addr)
            .filter(|link| link.is_connected())
            .map(|link| link.id)
    }
}

/// Stateless discovery probe; sequence 0 marks it as outside any channel.
fn probe_packet() -> Packet {
    Packet::new(PacketHeader::new(0, 0, 0), PacketType::DiscoverProbe)
}
