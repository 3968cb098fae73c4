//! Peer-to-peer links negotiated through a signaling relay.
//!
//! A [`Node`](core::node::Node) publishes its presence on the relay, answers
//! and initiates WebRTC negotiations over per-device signal mailboxes, and
//! carries chat and file transfers over one data channel per peer.

pub mod core;
pub mod utils;
pub mod workers;
