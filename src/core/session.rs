//! One peer session: an engine instance plus the state the manager keeps
//! around it (role, buffered remote ICE candidates, data channel).

use crate::core::connection::{
    ConnectionEngine, ConnectionState, DataChannel, IceCandidate, SignalingState,
};
use crate::core::error::{LinkError, LinkResult, NegotiationStep};
use crate::core::peer::PeerId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Which side of the negotiation this session plays. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the data channel and the offer.
    Initiator,
    /// Answers and waits for the peer's data channel.
    Responder,
}

/// Result of handing a remote candidate to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// No remote description yet; kept for the next flush.
    Buffered,
}

pub struct PeerSession {
    peer: PeerId,
    role: Role,
    generation: u64,
    engine: Arc<dyn ConnectionEngine>,
    /// Remote candidates received before any remote description, in arrival order.
    pending_ice: Vec<IceCandidate>,
    channel: Option<Arc<dyn DataChannel>>,
    data_channel_open: bool,
    /// The peer's presence record disappeared.
    departed: bool,
    created_at: Instant,
}

impl PeerSession {
    pub fn new(
        peer: PeerId,
        role: Role,
        generation: u64,
        engine: Arc<dyn ConnectionEngine>,
    ) -> Self {
        Self {
            peer,
            role,
            generation,
            engine,
            pending_ice: Vec::new(),
            channel: None,
            data_channel_open: false,
            departed: false,
            created_at: Instant::now(),
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn engine(&self) -> &Arc<dyn ConnectionEngine> {
        &self.engine
    }

    /// Sampled from the engine.
    pub fn state(&self) -> ConnectionState {
        self.engine.connection_state()
    }

    /// Sampled from the engine.
    pub fn signaling_state(&self) -> SignalingState {
        self.engine.signaling_state()
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    /// Hand over the buffer, leaving this session's empty.
    pub(crate) fn take_pending_ice(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending_ice)
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref()
    }

    pub(crate) fn set_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.channel = Some(channel);
    }

    pub fn data_channel_open(&self) -> bool {
        self.data_channel_open
    }

    pub(crate) fn set_data_channel_open(&mut self, open: bool) {
        self.data_channel_open = open;
    }

    pub fn departed(&self) -> bool {
        self.departed
    }

    pub(crate) fn mark_departed(&mut self) {
        self.departed = true;
    }

    pub(crate) fn clear_departed(&mut self) {
        self.departed = false;
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Apply `candidate` now if a remote description is set, else buffer it.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> LinkResult<CandidateOutcome> {
        if !self.engine.has_remote_description().await {
            debug!(
                event = "ice_buffered",
                peer = %self.peer.short(),
                pending = self.pending_ice.len() + 1,
                "Remote description not set, buffering ICE candidate"
            );
            self.pending_ice.push(candidate);
            return Ok(CandidateOutcome::Buffered);
        }
        self.engine
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| LinkError::negotiation(&self.peer, NegotiationStep::AddIceCandidate, e))?;
        Ok(CandidateOutcome::Applied)
    }

    /// Apply every buffered candidate in arrival order, best-effort.
    ///
    /// Must be called right after a remote description was applied. The buffer
    /// is emptied before the first candidate is applied, so no candidate can be
    /// both buffered and applied. Returns how many were applied successfully.
    pub async fn flush_pending_ice(&mut self) -> usize {
        let pending = std::mem::take(&mut self.pending_ice);
        if pending.is_empty() {
            return 0;
        }
        let total = pending.len();
        let mut applied = 0;
        for candidate in pending {
            match self.engine.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(
                        event = "ice_flush_candidate_failure",
                        peer = %self.peer.short(),
                        %e,
                        "Buffered ICE candidate rejected, continuing flush"
                    );
                }
            }
        }
        debug!(event = "ice_flushed", peer = %self.peer.short(), applied, total, "Flushed buffered ICE candidates");
        applied
    }

    /// Release the engine. Errors are logged; a dead engine may refuse to close.
    pub async fn close(&mut self) {
        self.data_channel_open = false;
        self.channel = None;
        if let Err(e) = self.engine.close().await {
            debug!(event = "engine_close_failure", peer = %self.peer.short(), %e, "Engine close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::mock::MockNetwork;
    use crate::core::connection::{
        DescriptionKind, EngineEventSink, EngineFactory, SessionDescription,
    };
    use tokio::sync::mpsc;

    fn candidate(s: &str) -> IceCandidate {
        IceCandidate {
            candidate: s.into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn responder_session(net: &MockNetwork) -> (PeerSession, Arc<crate::core::connection::mock::MockEngineFactory>) {
        let factory = net.factory();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerId::from("remote");
        let engine = factory
            .create(EngineEventSink::new(peer.clone(), 1, tx))
            .await
            .unwrap();
        (PeerSession::new(peer, Role::Responder, 1, engine), factory)
    }

    fn remote_offer() -> SessionDescription {
        SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: "mock-offer:999".into(),
        }
    }

    #[tokio::test]
    async fn candidates_buffer_until_remote_description_then_flush_in_order() {
        let net = MockNetwork::new();
        let (mut session, factory) = responder_session(&net).await;

        for c in ["c1", "c2", "c3"] {
            let out = session.add_remote_candidate(candidate(c)).await.unwrap();
            assert_eq!(out, CandidateOutcome::Buffered);
        }
        assert_eq!(session.pending_ice_len(), 3);

        session
            .engine()
            .set_remote_description(remote_offer())
            .await
            .unwrap();
        assert_eq!(session.flush_pending_ice().await, 3);
        assert_eq!(session.pending_ice_len(), 0);

        let engine = factory.latest(&PeerId::from("remote")).unwrap();
        assert_eq!(engine.applied_candidates(), vec!["c1", "c2", "c3"]);

        // A second flush applies nothing again.
        assert_eq!(session.flush_pending_ice().await, 0);
        assert_eq!(engine.applied_candidates().len(), 3);
    }

    #[tokio::test]
    async fn late_candidates_bypass_the_buffer() {
        let net = MockNetwork::new();
        let (mut session, factory) = responder_session(&net).await;
        session
            .engine()
            .set_remote_description(remote_offer())
            .await
            .unwrap();

        let out = session.add_remote_candidate(candidate("late")).await.unwrap();
        assert_eq!(out, CandidateOutcome::Applied);
        assert_eq!(session.pending_ice_len(), 0);
        let engine = factory.latest(&PeerId::from("remote")).unwrap();
        assert_eq!(engine.applied_candidates(), vec!["late"]);
    }

    #[tokio::test]
    async fn one_rejected_candidate_does_not_stop_the_flush() {
        let net = MockNetwork::new();
        net.fail_candidate("bad");
        let (mut session, factory) = responder_session(&net).await;
        for c in ["a", "bad", "b"] {
            session.add_remote_candidate(candidate(c)).await.unwrap();
        }
        session
            .engine()
            .set_remote_description(remote_offer())
            .await
            .unwrap();

        assert_eq!(session.flush_pending_ice().await, 2);
        let engine = factory.latest(&PeerId::from("remote")).unwrap();
        assert_eq!(engine.applied_candidates(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn close_releases_engine() {
        let net = MockNetwork::new();
        let (mut session, factory) = responder_session(&net).await;
        session.close().await;
        assert!(factory.latest(&PeerId::from("remote")).unwrap().is_closed());
        assert_eq!(session.state(), ConnectionState::Closed);
    }
}
