mod clients;
mod config;
mod events;
mod rooms;
mod server;

pub use config::ServerConfig;
pub use events::{DisconnectReason, ServerEvent};
pub use server::Server;
