use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use biribit::types::{ClientId, RoomId, UNASSIGNED};
use biribit::{
    Delivered, NetworkEndpoint, NetworkStats, Packet, PacketHeader, PacketType, Reliability,
};

use crate::clients::{ClientState, ConnectionManager};
use crate::config::ServerConfig;
use crate::events::{DisconnectReason, ServerEvent};
use crate::rooms::RoomManager;

pub struct Server {
    endpoint: NetworkEndpoint,
    config: ServerConfig,
    connections: ConnectionManager,
    rooms: RoomManager,
    running: Arc<AtomicBool>,
    pending_events: VecDeque<ServerEvent>,
}

impl Server {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind(bind_addr)?;
        let connections = ConnectionManager::new(
            config.max_clients,
            Duration::from_secs(config.timeout_secs),
        );

        Ok(Self {
            endpoint,
            connections,
            rooms: RoomManager::new(),
            running: Arc::new(AtomicBool::new(true)),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stats(&self) -> &NetworkStats {
        self.endpoint.stats()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ServerEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn run(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once();
            for event in self.pending_events.drain(..) {
                log_event(&event);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections();
    }

    pub fn tick_once(&mut self) {
        if let Err(e) = self.process_network() {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("network error: {}", e),
            });
        }
        self.flush_resends();
        self.cleanup_timed_out();
    }

    pub fn shutdown_connections(&mut self) {
        let client_ids: Vec<ClientId> = self.connections.iter().map(|c| c.client_id).collect();
        for client_id in client_ids {
            self.kick_client(client_id);
        }
    }

    pub fn kick_client(&mut self, client_id: ClientId) {
        if let Some(conn) = self.connections.get(client_id) {
            let addr = conn.addr;
            self.send_framed(addr, PacketType::Disconnect, Reliability::UNRELIABLE);
        }
        self.drop_client(client_id, DisconnectReason::Kicked);
    }

    fn drop_client(&mut self, client_id: ClientId, reason: DisconnectReason) {
        if self.connections.remove(client_id).is_some() {
            self.handle_departure(client_id, reason);
        }
    }

    /// Cleanup after a connection is already gone from the table.
    fn handle_departure(&mut self, client_id: ClientId, reason: DisconnectReason) {
        if let Some(outcome) = self.rooms.leave(client_id) {
            if outcome.destroyed {
                self.pending_events.push_back(ServerEvent::RoomDestroyed {
                    room_id: outcome.room_id,
                });
            }
            self.push_room_list();
        }
        self.push_client_list();
        self.pending_events
            .push_back(ServerEvent::ClientDisconnected { client_id, reason });
    }

    fn process_network(&mut self) -> io::Result<()> {
        let packets = self.endpoint.receive()?;

        for (packet, addr) in packets {
            self.handle_packet(packet, addr)?;
        }

        Ok(())
    }

    fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) -> io::Result<()> {
        match &packet.payload {
            PacketType::DiscoverProbe => {
                let response = Packet::new(
                    PacketHeader::new(0, 0, 0),
                    PacketType::DiscoverResponse {
                        name: self.config.name.clone(),
                        password_protected: self.config.password.is_some(),
                    },
                );
                self.endpoint.send_to(&response, addr)?;
                return Ok(());
            }
            PacketType::ConnectionRequest {
                client_salt,
                password,
            } => {
                self.pending_events
                    .push_back(ServerEvent::ClientConnecting { addr });

                if self.config.password.is_some() && *password != self.config.password {
                    self.deny(addr, "Invalid password")?;
                    return Ok(());
                }
                if let Err(reason) = self.connections.get_or_create_pending(addr, *client_salt) {
                    self.deny(addr, reason)?;
                    return Ok(());
                }
            }
            _ => {}
        }

        let now = Instant::now();
        let Some(conn) = self.connections.get_by_addr_mut(&addr) else {
            return Ok(());
        };
        conn.touch();

        let absorbed = conn.channel.absorb(packet, now);
        for delivered in absorbed.delivered {
            self.dispatch(addr, delivered);
        }
        if absorbed.wants_ack {
            self.send_framed(addr, PacketType::Ack, Reliability::UNRELIABLE);
        }

        Ok(())
    }

    fn deny(&mut self, addr: SocketAddr, reason: &str) -> io::Result<()> {
        let packet = Packet::new(
            PacketHeader::new(0, 0, 0),
            PacketType::ConnectionDenied {
                reason: reason.to_string(),
            },
        );
        self.endpoint.send_to(&packet, addr)?;
        self.pending_events.push_back(ServerEvent::ConnectionDenied {
            addr,
            reason: reason.to_string(),
        });
        Ok(())
    }

    fn dispatch(&mut self, addr: SocketAddr, delivered: Delivered) {
        let Delivered { payload, mask } = delivered;
        match payload {
            PacketType::ConnectionRequest { .. } => self.send_challenge(addr),
            PacketType::ChallengeResponse { combined_salt } => {
                self.handle_challenge_response(addr, combined_salt);
            }
            PacketType::SetClientParameters { name, appid } => {
                if let Some(conn) = self.connections.get_by_addr_mut(&addr) {
                    if conn.is_connected() {
                        conn.name = name;
                        conn.appid = appid;
                        self.push_client_list();
                    }
                }
            }
            PacketType::RoomListRequest => {
                let rooms = self.rooms.list();
                self.send_framed(
                    addr,
                    PacketType::RoomList { rooms },
                    Reliability::RELIABLE_ORDERED,
                );
            }
            PacketType::RoomCreate {
                slot_count,
                join_slot,
            } => self.handle_room_create(addr, slot_count, join_slot),
            PacketType::RoomJoin { room_id, slot } => self.handle_room_join(addr, room_id, slot),
            PacketType::RoomJoinRandomOrCreate { slot_count } => {
                self.handle_join_random(addr, slot_count);
            }
            PacketType::RoomLeave => self.handle_room_leave(addr),
            PacketType::RoomBroadcast { data } => self.relay_broadcast(addr, data, mask),
            PacketType::RoomEntrySubmit { data } => self.handle_entry_submit(addr, data),
            PacketType::RoomEntriesRequest { room_id, since } => {
                self.handle_entries_request(addr, room_id, since);
            }
            PacketType::Ping { timestamp } => {
                self.send_framed(
                    addr,
                    PacketType::Pong { timestamp },
                    Reliability::UNRELIABLE,
                );
            }
            PacketType::Disconnect => {
                if let Some(conn) = self.connections.remove_by_addr(&addr) {
                    self.handle_departure(conn.client_id, DisconnectReason::Graceful);
                }
            }
            _ => {}
        }
    }

    fn send_challenge(&mut self, addr: SocketAddr) {
        let Some(conn) = self.connections.get_by_addr(&addr) else {
            return;
        };
        if conn.is_connected() {
            return;
        }
        let payload = PacketType::ConnectionChallenge {
            server_salt: conn.server_salt,
            challenge: conn.combined_salt(),
        };
        // Unreliable: the client keeps resending its request until answered.
        self.send_framed(addr, payload, Reliability::UNRELIABLE);
    }

    fn handle_challenge_response(&mut self, addr: SocketAddr, combined_salt: u64) {
        let Some(conn) = self.connections.get_by_addr_mut(&addr) else {
            return;
        };
        if conn.is_connected() {
            return;
        }
        if combined_salt != conn.combined_salt() {
            self.pending_events.push_back(ServerEvent::Error {
                message: format!("invalid challenge response from {}", addr),
            });
            return;
        }

        conn.state = ClientState::Connected;
        let client_id = conn.client_id;

        self.pending_events
            .push_back(ServerEvent::ClientConnected { client_id, addr });

        self.send_framed(
            addr,
            PacketType::ConnectionAccepted {
                client_id,
                server_name: self.config.name.clone(),
            },
            Reliability::RELIABLE_ORDERED,
        );
        self.push_client_list();
    }

    fn handle_room_create(&mut self, addr: SocketAddr, slot_count: u32, join_slot: Option<u32>) {
        let Some(client_id) = self.connected_id(addr) else {
            return;
        };

        match self.rooms.create(slot_count) {
            Ok(room_id) => {
                self.pending_events.push_back(ServerEvent::RoomCreated {
                    room_id,
                    slot_count,
                });
                if let Some(slot) = join_slot {
                    if let Err(reason) = self.rooms.join(room_id, client_id, Some(slot)) {
                        log::warn!(
                            "client {} could not join its new room {}: {}",
                            client_id,
                            room_id,
                            reason
                        );
                    }
                }
                self.send_join_status(addr, client_id);
                self.push_room_list();
            }
            Err(reason) => {
                log::warn!("room creation by client {} failed: {}", client_id, reason);
                self.send_join_status(addr, client_id);
            }
        }
    }

    fn handle_room_join(&mut self, addr: SocketAddr, room_id: RoomId, slot: Option<u32>) {
        let Some(client_id) = self.connected_id(addr) else {
            return;
        };

        match self.rooms.join(room_id, client_id, slot) {
            Ok(_) => self.push_room_list(),
            Err(reason) => {
                log::warn!(
                    "client {} failed to join room {}: {}",
                    client_id,
                    room_id,
                    reason
                );
            }
        }
        // Either way the client learns where it actually is.
        self.send_join_status(addr, client_id);
    }

    fn handle_join_random(&mut self, addr: SocketAddr, slot_count: u32) {
        let Some(client_id) = self.connected_id(addr) else {
            return;
        };

        let rooms_before = self.rooms.room_count();
        match self.rooms.join_random_or_create(client_id, slot_count) {
            Ok((room_id, _)) => {
                if self.rooms.room_count() > rooms_before {
                    self.pending_events.push_back(ServerEvent::RoomCreated {
                        room_id,
                        slot_count,
                    });
                }
                self.push_room_list();
            }
            Err(reason) => {
                log::warn!("client {} could not join any room: {}", client_id, reason);
            }
        }
        self.send_join_status(addr, client_id);
    }

    fn handle_room_leave(&mut self, addr: SocketAddr) {
        let Some(client_id) = self.connected_id(addr) else {
            return;
        };

        if let Some(outcome) = self.rooms.leave(client_id) {
            if outcome.destroyed {
                self.pending_events.push_back(ServerEvent::RoomDestroyed {
                    room_id: outcome.room_id,
                });
            }
            self.push_room_list();
        }
        self.send_join_status(addr, client_id);
    }

    /// Forwards a room message to every occupant, the sender included, with
    /// the delivery guarantees the sender asked for.
    fn relay_broadcast(&mut self, addr: SocketAddr, data: Vec<u8>, mask: Reliability) {
        let Some(client_id) = self.connected_id(addr) else {
            return;
        };
        let Some((room_id, slot)) = self.rooms.membership(client_id) else {
            log::debug!("client {} broadcast outside any room, dropped", client_id);
            return;
        };

        let when_ms = epoch_ms();
        let targets: Vec<SocketAddr> = self
            .rooms
            .occupants(room_id)
            .into_iter()
            .filter_map(|occupant| self.connections.get(occupant))
            .map(|conn| conn.addr)
            .collect();

        for target in targets {
            self.send_framed(
                target,
                PacketType::BroadcastDelivery {
                    when_ms,
                    room_id,
                    slot: slot as u8,
                    data: data.clone(),
                },
                mask,
            );
        }
    }

    /// Appends to the sender's room journal and announces the new entry to
    /// every occupant.
    fn handle_entry_submit(&mut self, addr: SocketAddr, data: Vec<u8>) {
        let Some(client_id) = self.connected_id(addr) else {
            return;
        };
        let Some((room_id, slot)) = self.rooms.membership(client_id) else {
            log::debug!("client {} sent an entry outside any room, dropped", client_id);
            return;
        };

        let Some(entry) = self.rooms.append_entry(room_id, slot as u8, data) else {
            return;
        };
        let count = self.rooms.entry_count(room_id);

        let targets: Vec<SocketAddr> = self
            .rooms
            .occupants(room_id)
            .into_iter()
            .filter_map(|occupant| self.connections.get(occupant))
            .map(|conn| conn.addr)
            .collect();
        for target in targets {
            self.send_framed(
                target,
                PacketType::RoomEntriesStatus {
                    room_id,
                    count,
                    entries: vec![entry.clone()],
                },
                Reliability::RELIABLE_ORDERED,
            );
        }
    }

    fn handle_entries_request(&mut self, addr: SocketAddr, room_id: RoomId, since: u32) {
        let Some(client_id) = self.connected_id(addr) else {
            return;
        };
        // Journals are only readable from inside the room.
        if self.rooms.membership(client_id).map(|(room, _)| room) != Some(room_id) {
            return;
        }

        let entries = self.rooms.entries_after(room_id, since);
        let count = self.rooms.entry_count(room_id);
        self.send_framed(
            addr,
            PacketType::RoomEntriesStatus {
                room_id,
                count,
                entries,
            },
            Reliability::RELIABLE_ORDERED,
        );
    }

    fn send_join_status(&mut self, addr: SocketAddr, client_id: ClientId) {
        let (room_id, slot) = self.rooms.membership(client_id).unwrap_or((UNASSIGNED, 0));
        self.send_framed(
            addr,
            PacketType::JoinStatus { room_id, slot },
            Reliability::RELIABLE_ORDERED,
        );
        // A freshly joined client learns the journal size and pulls what it
        // is missing.
        if room_id != UNASSIGNED {
            let count = self.rooms.entry_count(room_id);
            self.send_framed(
                addr,
                PacketType::RoomEntriesStatus {
                    room_id,
                    count,
                    entries: Vec::new(),
                },
                Reliability::RELIABLE_ORDERED,
            );
        }
    }

    fn push_client_list(&mut self) {
        let clients = self.connections.remote_client_list();
        for addr in self.connected_addrs() {
            self.send_framed(
                addr,
                PacketType::ClientList {
                    clients: clients.clone(),
                },
                Reliability::RELIABLE_ORDERED,
            );
        }
    }

    fn push_room_list(&mut self) {
        let rooms = self.rooms.list();
        for addr in self.connected_addrs() {
            self.send_framed(
                addr,
                PacketType::RoomList {
                    rooms: rooms.clone(),
                },
                Reliability::RELIABLE_ORDERED,
            );
        }
    }

    fn connected_addrs(&self) -> Vec<SocketAddr> {
        self.connections
            .iter()
            .filter(|conn| conn.is_connected())
            .map(|conn| conn.addr)
            .collect()
    }

    fn connected_id(&self, addr: SocketAddr) -> Option<ClientId> {
        self.connections
            .get_by_addr(&addr)
            .filter(|conn| conn.is_connected())
            .map(|conn| conn.client_id)
    }

    fn send_framed(&mut self, addr: SocketAddr, payload: PacketType, mask: Reliability) {
        let now = Instant::now();
        let Some(conn) = self.connections.get_by_addr_mut(&addr) else {
            return;
        };
        match conn.channel.frame(payload, mask, now) {
            Ok(bytes) => {
                if let Err(e) = self.endpoint.send_bytes(&bytes, addr) {
                    log::warn!("send to {} failed: {}", addr, e);
                }
            }
            Err(e) => log::warn!("failed to frame packet for {}: {}", addr, e),
        }
    }

    fn flush_resends(&mut self) {
        let now = Instant::now();
        let mut outgoing: Vec<(SocketAddr, Vec<u8>)> = Vec::new();
        let mut dead: Vec<ClientId> = Vec::new();

        for conn in self.connections.iter_mut() {
            for bytes in conn.channel.resends_due(now) {
                outgoing.push((conn.addr, bytes));
            }
            if conn.channel.is_dead() {
                dead.push(conn.client_id);
            }
        }

        for (addr, bytes) in outgoing {
            if let Err(e) = self.endpoint.send_bytes(&bytes, addr) {
                log::warn!("send to {} failed: {}", addr, e);
            }
        }
        for client_id in dead {
            self.drop_client(client_id, DisconnectReason::Unreachable);
        }
    }

    fn cleanup_timed_out(&mut self) {
        for client_id in self.connections.cleanup_timed_out() {
            self.handle_departure(client_id, DisconnectReason::Timeout);
        }
    }
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::ClientConnecting { addr } => {
            log::debug!("connection request from {}", addr);
        }
        ServerEvent::ClientConnected { client_id, addr } => {
            log::info!("client {} connected from {}", client_id, addr);
        }
        ServerEvent::ClientDisconnected { client_id, reason } => {
            log::info!("client {} {}", client_id, reason.as_str());
        }
        ServerEvent::ConnectionDenied { addr, reason } => {
            log::warn!("connection denied to {}: {}", addr, reason);
        }
        ServerEvent::RoomCreated {
            room_id,
            slot_count,
        } => {
            log::info!("room {} created with {} slots", room_id, slot_count);
        }
        ServerEvent::RoomDestroyed { room_id } => {
            log::info!("room {} destroyed", room_id);
        }
        ServerEvent::Error { message } => log::error!("{}", message),
    }
}

fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
