pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod manager;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transfer;
