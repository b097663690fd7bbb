mod client;
mod config;
mod connection;
mod discover;
mod queue;
mod worker;

pub use client::Client;
pub use config::ClientConfig;

pub use biribit::types::{
    ClientId, ClientParameters, ConnectionId, Entry, Received, RemoteClient, Room, RoomId,
    ServerConnection, ServerInfo, UNASSIGNED,
};
pub use biribit::{DEFAULT_PORT, Reliability};
