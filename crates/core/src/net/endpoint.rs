use std::io;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use super::protocol::{MAX_PACKET_SIZE, Packet};

/// Datagram counters for one endpoint.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// A non-blocking UDP socket speaking our packet framing to many peers.
pub struct NetworkEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stats: NetworkStats,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl NetworkEndpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            stats: NetworkStats::default(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    /// Allows `broadcast` on this socket.
    pub fn enable_broadcast(&self) -> io::Result<()> {
        self.socket.set_broadcast(true)
    }

    /// Sends pre-framed bytes, as produced by a reliability channel.
    pub fn send_bytes(&mut self, data: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Packet exceeds MTU",
            ));
        }

        let bytes = self.socket.send_to(data, addr)?;

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;

        Ok(bytes)
    }

    pub fn send_to(&mut self, packet: &Packet, addr: SocketAddr) -> io::Result<usize> {
        let data = packet.serialize().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Serialization error: {}", e),
            )
        })?;

        self.send_bytes(&data, addr)
    }

    /// Sends a packet to the IPv4 broadcast address on the given port.
    pub fn broadcast(&mut self, packet: &Packet, port: u16) -> io::Result<usize> {
        self.send_to(packet, SocketAddr::from((Ipv4Addr::BROADCAST, port)))
    }

    /// Drains every datagram currently queued on the socket. Undecodable or
    /// foreign-protocol datagrams are skipped silently.
    pub fn receive(&mut self) -> io::Result<Vec<(Packet, SocketAddr)>> {
        let mut packets = Vec::new();

        loop {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    if size < 8 {
                        continue;
                    }

                    match Packet::deserialize(&self.recv_buffer[..size]) {
                        Ok(packet) => {
                            if !packet.header.is_valid() {
                                continue;
                            }

                            self.stats.packets_received += 1;
                            self.stats.bytes_received += size as u64;

                            packets.push((packet, addr));
                        }
                        Err(_) => continue,
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        Ok(packets)
    }
}
