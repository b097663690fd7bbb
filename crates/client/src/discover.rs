use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use biribit::ServerInfo;

/// Servers seen answering discovery probes, keyed by their address.
///
/// Entries accumulate across probes until explicitly cleared; a server that
/// answers again in place updates its entry rather than duplicating it.
#[derive(Debug, Default)]
pub struct DiscoverRegistry {
    entries: HashMap<SocketAddr, ServerInfo>,
    last_probe: Option<Instant>,
}

impl DiscoverRegistry {
    /// Records the moment a probe went out, for ping estimation.
    pub fn begin_probe(&mut self, now: Instant) {
        self.last_probe = Some(now);
    }

    pub fn observe(
        &mut self,
        addr: SocketAddr,
        name: String,
        password_protected: bool,
        now: Instant,
    ) {
        let ping = self
            .last_probe
            .map(|probe| now.saturating_duration_since(probe).as_millis() as u32)
            .unwrap_or(0);

        self.entries.insert(
            addr,
            ServerInfo {
                name,
                addr: addr.ip().to_string(),
                port: addr.port(),
                ping,
                password_protected,
            },
        );
    }

    pub fn known_addrs(&self) -> Vec<SocketAddr> {
        self.entries.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// The current entries in a stable order.
    pub fn snapshot(&self) -> Vec<ServerInfo> {
        let mut servers: Vec<ServerInfo> = self.entries.values().cloned().collect();
        servers.sort_by(|a, b| (&a.addr, a.port).cmp(&(&b.addr, b.port)));
        servers
    }
}
