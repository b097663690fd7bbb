use std::time::Duration;

/// Tunables for a client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a handshake may run before the attempt is abandoned.
    pub connect_timeout: Duration,
    /// Inactivity window after which an established connection is dropped.
    pub connection_timeout: Duration,
    /// Interval between handshake retransmissions while connecting.
    pub handshake_resend: Duration,
    /// Interval between keepalive pings on established connections.
    pub ping_interval: Duration,
    /// Capacity of the received-message queue.
    pub received_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            handshake_resend: Duration::from_millis(250),
            ping_interval: Duration::from_secs(1),
            received_capacity: 1024,
        }
    }
}
