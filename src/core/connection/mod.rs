//! Connection engine seam.
//!
//! The session manager drives one [`ConnectionEngine`] per peer session through
//! this command surface and hears back through [`EngineEvent`]s, which arrive
//! on a channel instead of callbacks so the manager consumes them in order on
//! its own loop.

#[cfg(test)]
pub(crate) mod mock;
pub mod webrtc;

use crate::core::peer::PeerId;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Engine state ─────────────────────────────────────────────────────────────

/// Peer connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Connected or on its way there.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }

    /// The engine instance is no longer usable and should be replaced.
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Failed | Self::Disconnected | Self::Closed)
    }
}

/// Offer/answer negotiation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

// ── Negotiation payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: DescriptionKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
}

// ── Data channel ─────────────────────────────────────────────────────────────

/// One unit received from or sent on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// Ordered, reliable message channel opened over an established engine.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send(&self, frame: Frame) -> Result<()>;
}

// ── Events ───────────────────────────────────────────────────────────────────

/// Something an engine reports about its session.
pub enum EngineEvent {
    /// A local ICE candidate to forward to the peer.
    IceCandidate(IceCandidate),
    ConnectionStateChanged(ConnectionState),
    /// A data channel exists (created locally or announced by the peer).
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(Frame),
    ChannelClosed,
    ChannelError(String),
}

impl fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::ConnectionStateChanged(s) => {
                f.debug_tuple("ConnectionStateChanged").field(s).finish()
            }
            Self::DataChannel(dc) => f.debug_tuple("DataChannel").field(&dc.label()).finish(),
            Self::ChannelOpen => f.write_str("ChannelOpen"),
            Self::ChannelMessage(frame) => f.debug_tuple("ChannelMessage").field(frame).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
        }
    }
}

/// An [`EngineEvent`] tagged with the session it belongs to.
#[derive(Debug)]
pub struct SessionEvent {
    pub peer: PeerId,
    /// Engine instance number; events of replaced engines are stale.
    pub generation: u64,
    pub event: EngineEvent,
}

/// Handle an engine uses to report events for one session generation.
#[derive(Clone)]
pub struct EngineEventSink {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EngineEventSink {
    pub fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Forward `event`; returns `false` once the consumer is gone.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(SessionEvent {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

/// Per-session negotiation and transport capability.
#[async_trait]
pub trait ConnectionEngine: Send + Sync {
    /// Create the session's data channel (initiator side).
    async fn create_data_channel(&self, label: &str) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    /// Release every resource held by the engine.
    async fn close(&self) -> Result<()>;
}

/// Builds a fresh engine for each session generation.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self, sink: EngineEventSink) -> Result<Arc<dyn ConnectionEngine>>;
}
