use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use biribit::types::{ClientId, RemoteClient};
use biribit::ReliableChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Challenge issued, response pending.
    Pending,
    Connected,
}

/// Server-side state for one client, created on the first connection request.
#[derive(Debug)]
pub struct ClientConnection {
    pub addr: SocketAddr,
    pub client_id: ClientId,
    pub state: ClientState,
    pub client_salt: u64,
    pub server_salt: u64,
    pub channel: ReliableChannel,
    pub name: String,
    pub appid: String,
    pub last_receive_time: Instant,
}

impl ClientConnection {
    pub fn new(addr: SocketAddr, client_id: ClientId, client_salt: u64) -> Self {
        Self {
            addr,
            client_id,
            state: ClientState::Pending,
            client_salt,
            server_salt: rand_u64(),
            channel: ReliableChannel::new(),
            name: String::new(),
            appid: String::new(),
            last_receive_time: Instant::now(),
        }
    }

    pub fn combined_salt(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }
}

/// Address- and id-indexed table of client connections.
pub struct ConnectionManager {
    clients_by_addr: HashMap<SocketAddr, ClientId>,
    clients: HashMap<ClientId, ClientConnection>,
    next_client_id: ClientId,
    max_clients: usize,
    timeout: Duration,
}

impl ConnectionManager {
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients_by_addr: HashMap::new(),
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Returns the connection for `addr`, creating a pending one when the
    /// address is new. Repeated requests from a pending address refresh its
    /// salt so a restarted client can handshake again.
    pub fn get_or_create_pending(
        &mut self,
        addr: SocketAddr,
        client_salt: u64,
    ) -> Result<&mut ClientConnection, &'static str> {
        if let Some(&client_id) = self.clients_by_addr.get(&addr) {
            let conn = self
                .clients
                .get_mut(&client_id)
                .ok_or("connection table out of sync")?;
            if conn.state == ClientState::Pending {
                conn.client_salt = client_salt;
            }
            return Ok(conn);
        }

        if self.clients.len() >= self.max_clients {
            return Err("Server full");
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        self.clients_by_addr.insert(addr, client_id);
        Ok(self
            .clients
            .entry(client_id)
            .or_insert(ClientConnection::new(addr, client_id, client_salt)))
    }

    pub fn get(&self, client_id: ClientId) -> Option<&ClientConnection> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut ClientConnection> {
        self.clients.get_mut(&client_id)
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&ClientConnection> {
        self.clients_by_addr
            .get(addr)
            .and_then(|id| self.clients.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ClientConnection> {
        if let Some(&id) = self.clients_by_addr.get(addr) {
            self.clients.get_mut(&id)
        } else {
            None
        }
    }

    pub fn remove(&mut self, client_id: ClientId) -> Option<ClientConnection> {
        if let Some(conn) = self.clients.remove(&client_id) {
            self.clients_by_addr.remove(&conn.addr);
            Some(conn)
        } else {
            None
        }
    }

    pub fn remove_by_addr(&mut self, addr: &SocketAddr) -> Option<ClientConnection> {
        if let Some(client_id) = self.clients_by_addr.remove(addr) {
            self.clients.remove(&client_id)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClientConnection> {
        self.clients.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ClientConnection> {
        self.clients.values_mut()
    }

    pub fn cleanup_timed_out(&mut self) -> Vec<ClientId> {
        let timed_out: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_timed_out(self.timeout))
            .map(|(&id, _)| id)
            .collect();

        for id in &timed_out {
            self.remove(*id);
        }

        timed_out
    }

    pub fn connected_count(&self) -> usize {
        self.clients.values().filter(|c| c.is_connected()).count()
    }

    /// The identity list pushed to clients, sorted by id.
    pub fn remote_client_list(&self) -> Vec<RemoteClient> {
        let mut clients: Vec<RemoteClient> = self
            .clients
            .values()
            .filter(|c| c.is_connected())
            .map(|c| RemoteClient {
                id: c.client_id,
                name: c.name.clone(),
                appid: c.appid.clone(),
            })
            .collect();
        clients.sort_by_key(|c| c.id);
        clients
    }
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default(),
    );
    hasher.finish()
}
