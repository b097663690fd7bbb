mod channel;
mod endpoint;
mod ordering;
mod protocol;
mod resend;
mod tracking;

pub use channel::{Absorbed, Delivered, ReliableChannel};
pub use endpoint::{NetworkEndpoint, NetworkStats};
pub use ordering::OrderedChannel;
pub use protocol::{
    DEFAULT_PORT, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError,
    PacketHeader, PacketType, Reliability, sequence_greater_than,
};
pub use resend::ResendQueue;
pub use tracking::{AckTracker, ReceiveTracker, RttEstimator};
