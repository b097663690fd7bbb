/// Server tunables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name announced in discovery responses and on acceptance.
    pub name: String,
    pub max_clients: usize,
    /// When set, connection requests must carry the matching password.
    pub password: Option<String>,
    /// Inactivity window after which a client is dropped.
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Biribit Server".to_string(),
            max_clients: 32,
            password: None,
            timeout_secs: 10,
        }
    }
}
