pub mod net;
pub mod snapshot;
pub mod types;

pub use net::{
    Absorbed, AckTracker, Delivered, NetworkEndpoint, NetworkStats, OrderedChannel, Packet,
    PacketError, PacketHeader, PacketType, ReceiveTracker, Reliability, ReliableChannel,
    ResendQueue, sequence_greater_than,
};
pub use net::{DEFAULT_PORT, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION};
pub use snapshot::Revisioned;
pub use types::{
    ClientId, ClientParameters, ConnectionId, Entry, Received, RemoteClient, Room, RoomId,
    ServerConnection, ServerInfo, UNASSIGNED,
};
