//! Error taxonomy for the link core.
//!
//! Every variant is scoped to one peer or one transfer; none of them is fatal
//! to the node. Engine and transport implementations report `anyhow::Error`,
//! which is wrapped here at the core boundary.

use super::peer::PeerId;
use std::fmt;
use thiserror::Error;

/// Negotiation step that failed, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    CreateEngine,
    CreateDataChannel,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    AddIceCandidate,
}

impl fmt::Display for NegotiationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreateEngine => "create engine",
            Self::CreateDataChannel => "create data channel",
            Self::CreateOffer => "create offer",
            Self::CreateAnswer => "create answer",
            Self::SetLocalDescription => "set local description",
            Self::SetRemoteDescription => "set remote description",
            Self::AddIceCandidate => "add ICE candidate",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    /// The engine rejected a description or candidate; the attempt is abandoned.
    #[error("negotiation with {peer} failed at {step}: {source}")]
    Negotiation {
        peer: PeerId,
        step: NegotiationStep,
        #[source]
        source: anyhow::Error,
    },

    /// Relay put/remove/subscribe failed; the next natural trigger retries.
    #[error("signal transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// No accept/decline arrived within the offer window.
    #[error("transfer {0} timed out waiting for a response")]
    TransferTimeout(String),

    /// Malformed or unexpected unit on the data channel; the unit is discarded.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no open data channel to {0}")]
    ChannelUnavailable(PeerId),

    #[error("an outbound transfer to {0} is already active")]
    TransferBusy(PeerId),

    #[error("unknown transfer {0}")]
    UnknownTransfer(String),

    #[error("node is not running")]
    NodeStopped,
}

impl LinkError {
    pub(crate) fn negotiation(peer: &PeerId, step: NegotiationStep, source: anyhow::Error) -> Self {
        Self::Negotiation {
            peer: peer.clone(),
            step,
            source,
        }
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
