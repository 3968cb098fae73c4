//! Signaling envelopes exchanged through the relay.
//!
//! Envelopes travel through [`SignalTransport`] under `signals/{recipient}`,
//! never on the data channel. The payload stays an opaque JSON blob until the
//! session manager decodes it for the step that needs it.

mod relay;
mod transport;

pub use relay::{MemoryRelay, RelayClient};
pub use transport::{ChildEvent, SignalTransport, Subscription};

use crate::core::config::{DEVICES_NAMESPACE, SIGNALS_NAMESPACE};
use crate::core::connection::{IceCandidate, SessionDescription};
use crate::core::peer::{now_millis, PeerId};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// One negotiation message addressed to a single recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: PeerId,
    pub kind: SignalKind,
    /// JSON-encoded [`SessionDescription`] or [`IceCandidate`].
    pub payload: String,
    /// Unix millis at which the sender published the envelope.
    pub timestamp: u64,
}

impl SignalEnvelope {
    pub fn offer(from: &PeerId, desc: &SessionDescription) -> Result<Self> {
        Self::build(from, SignalKind::Offer, serde_json::to_string(desc)?)
    }

    pub fn answer(from: &PeerId, desc: &SessionDescription) -> Result<Self> {
        Self::build(from, SignalKind::Answer, serde_json::to_string(desc)?)
    }

    pub fn candidate(from: &PeerId, candidate: &IceCandidate) -> Result<Self> {
        Self::build(from, SignalKind::IceCandidate, serde_json::to_string(candidate)?)
    }

    fn build(from: &PeerId, kind: SignalKind, payload: String) -> Result<Self> {
        Ok(Self {
            from: from.clone(),
            kind,
            payload,
            timestamp: now_millis(),
        })
    }

    /// Decode the payload of an `Offer` or `Answer`.
    pub fn description(&self) -> Result<SessionDescription> {
        match self.kind {
            SignalKind::Offer | SignalKind::Answer => Ok(serde_json::from_str(&self.payload)?),
            SignalKind::IceCandidate => Err(anyhow!("ICE candidate envelope has no description")),
        }
    }

    /// Decode the payload of an `IceCandidate`.
    pub fn ice_candidate(&self) -> Result<IceCandidate> {
        match self.kind {
            SignalKind::IceCandidate => Ok(serde_json::from_str(&self.payload)?),
            _ => Err(anyhow!("{:?} envelope carries no ICE candidate", self.kind)),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Presence record a device keeps under `devices/{peer_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub peer_id: PeerId,
    pub display_name: String,
    /// Unix millis of the last write by the owner.
    pub timestamp: u64,
}

impl PresenceRecord {
    pub fn new(peer_id: PeerId, display_name: impl Into<String>) -> Self {
        Self {
            peer_id,
            display_name: display_name.into(),
            timestamp: now_millis(),
        }
    }
}

/// Mailbox namespace of `recipient`.
pub fn signals_namespace(recipient: &PeerId) -> String {
    format!("{SIGNALS_NAMESPACE}/{recipient}")
}

pub fn devices_namespace() -> &'static str {
    DEVICES_NAMESPACE
}
