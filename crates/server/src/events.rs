use std::net::SocketAddr;

use biribit::types::{ClientId, RoomId};

#[derive(Debug, Clone)]
pub enum ServerEvent {
    ClientConnecting {
        addr: SocketAddr,
    },
    ClientConnected {
        client_id: ClientId,
        addr: SocketAddr,
    },
    ClientDisconnected {
        client_id: ClientId,
        reason: DisconnectReason,
    },
    ConnectionDenied {
        addr: SocketAddr,
        reason: String,
    },
    RoomCreated {
        room_id: RoomId,
        slot_count: u32,
    },
    RoomDestroyed {
        room_id: RoomId,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum DisconnectReason {
    Graceful,
    Timeout,
    Kicked,
    Unreachable,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::Unreachable => "unreachable",
        }
    }
}
