use std::net::SocketAddr;
use std::time::Instant;

use biribit::types::{ClientId, ClientParameters, ConnectionId, RoomId, UNASSIGNED};
use biribit::ReliableChannel;

/// Handshake progress of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// ConnectionRequest sent, waiting for the challenge.
    Requesting,
    /// Challenge answered, waiting for acceptance.
    AwaitingAccept,
    Connected,
}

/// Client-side state for one server, from first request to teardown.
pub struct ServerLink {
    pub addr: SocketAddr,
    pub state: LinkState,
    pub channel: ReliableChannel,
    /// Assigned once the server accepts; `UNASSIGNED` during the handshake.
    pub id: ConnectionId,
    pub server_name: String,
    pub client_salt: u64,
    pub server_salt: u64,
    pub password: Option<String>,
    pub started_at: Instant,
    pub last_handshake_send: Instant,
    pub last_receive: Instant,
    pub last_ping: Instant,
    pub local_client_id: ClientId,
    /// Identity last announced to the server; repeats are suppressed and the
    /// value is replayed on accept.
    pub announced_parameters: Option<ClientParameters>,
    pub joined_room: RoomId,
    pub joined_slot: u32,
    /// High-water mark of journal entry ids already requested.
    pub entries_requested: u32,
}

impl ServerLink {
    pub fn new(addr: SocketAddr, password: Option<String>, now: Instant) -> Self {
        Self {
            addr,
            state: LinkState::Requesting,
            channel: ReliableChannel::new(),
            id: UNASSIGNED,
            server_name: String::new(),
            client_salt: generate_salt(),
            server_salt: 0,
            password,
            started_at: now,
            last_handshake_send: now,
            last_receive: now,
            last_ping: now,
            local_client_id: UNASSIGNED,
            announced_parameters: None,
            joined_room: UNASSIGNED,
            joined_slot: 0,
            entries_requested: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}

pub fn generate_salt() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(epoch_ms().wrapping_mul(0x9E37_79B9_7F4A_7C15));
    hasher.finish()
}

/// Milliseconds since the unix epoch.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_link_starts_requesting() {
        let link = ServerLink::new("127.0.0.1:8287".parse().unwrap(), None, Instant::now());
        assert_eq!(link.state, LinkState::Requesting);
        assert_eq!(link.id, UNASSIGNED);
        assert_eq!(link.joined_room, UNASSIGNED);
        assert!(!link.is_connected());
    }

    #[test]
    fn salts_vary_between_links() {
        let a = generate_salt();
        let b = generate_salt();
        assert_ne!(a, b);
    }
}
