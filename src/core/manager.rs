//! Peer session manager: the per-peer signaling state machine.
//!
//! # Negotiation
//!
//! - `connect`: only the side with the lesser [`PeerId`] offers (tie-break).
//! - `Offer`: answered unless a live negotiation already covers it; on glare
//!   the greater id keeps its offer, the lesser id resets and answers.
//! - `Answer`: applied only while a local offer is outstanding.
//! - `IceCandidate`: applied, or buffered until a remote description exists.
//!
//! Every step may fail; a failure abandons that attempt for that peer only.
//! Callers feed envelopes one at a time in arrival order and delete each from
//! the relay afterwards; the manager itself never reads the mailbox.

use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::connection::{
    ConnectionState, DataChannel, DescriptionKind, EngineEvent, EngineEventSink, EngineFactory,
    Frame, SessionDescription, SessionEvent, SignalingState,
};
use crate::core::error::{LinkError, LinkResult, NegotiationStep};
use crate::core::peer::PeerId;
use crate::core::session::{CandidateOutcome, PeerSession, Role};
use crate::core::signaling::{signals_namespace, SignalEnvelope, SignalKind, SignalTransport};
use anyhow::anyhow;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    OfferSent,
    /// A Connected or Connecting session already exists.
    AlreadyActive,
    /// Our previous offer is still waiting for its answer.
    OfferPending,
    /// The peer wins the tie-break and is expected to offer instead.
    WaitingForPeer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Answered,
    /// Glare lost: our offer was discarded and the peer's answered.
    AnsweredAfterGlare,
    /// Glare won: the peer's offer was ignored, ours stands.
    GlareKept,
    AnswerApplied,
    CandidateApplied,
    CandidateBuffered,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    AlreadyConnected,
    /// Offer for a session that already completed an exchange.
    AlreadyNegotiated,
    /// We already hold an unanswered offer from this peer.
    DuplicateOffer,
    /// Answer without an outstanding local offer.
    UnexpectedAnswer,
    UnknownPeer,
    FromSelf,
}

/// What a consumed engine event means for the layers above.
#[derive(Debug, PartialEq)]
pub enum SessionUpdate {
    StateChanged(PeerId, ConnectionState),
    ChannelOpened(PeerId),
    ChannelClosed(PeerId),
    Frame(PeerId, Frame),
}

pub struct PeerSessionManager {
    local_id: PeerId,
    transport: Arc<dyn SignalTransport>,
    engines: Arc<dyn EngineFactory>,
    sessions: HashMap<PeerId, PeerSession>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    next_generation: u64,
    tie_break_initiation: bool,
    /// Peers whose open data channel went away with a removed session. The
    /// engine's own close event is stale by then and never reported.
    closed_channels: Vec<PeerId>,
}

impl PeerSessionManager {
    /// Returns the manager and the receiver its engines report into. The owner
    /// must feed every received event back through [`Self::on_session_event`].
    pub fn new(
        local_id: PeerId,
        transport: Arc<dyn SignalTransport>,
        engines: Arc<dyn EngineFactory>,
        tie_break_initiation: bool,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id,
                transport,
                engines,
                sessions: HashMap::new(),
                events_tx,
                next_generation: 0,
                tie_break_initiation,
                closed_channels: Vec::new(),
            },
            events_rx,
        )
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection_state_of(peer) == Some(ConnectionState::Connected)
    }

    pub fn connection_state_of(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.sessions.get(peer).map(|s| s.state())
    }

    pub fn session(&self, peer: &PeerId) -> Option<&PeerSession> {
        self.sessions.get(peer)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The peer's data channel, if it is open. The transport's own view
    /// counts too: its close event may still be queued.
    pub fn channel_of(&self, peer: &PeerId) -> Option<Arc<dyn DataChannel>> {
        let session = self.sessions.get(peer)?;
        if !session.data_channel_open() {
            return None;
        }
        session.channel().filter(|c| c.is_open()).cloned()
    }

    // ── Outbound ─────────────────────────────────────────────────────────────

    /// Start a session with `peer` as initiator.
    pub async fn connect(&mut self, peer: &PeerId) -> LinkResult<ConnectOutcome> {
        if let Some(existing) = self.sessions.get(peer) {
            let state = existing.state();
            if state.is_active() {
                debug!(event = "connect_skipped", peer = %peer.short(), ?state, "Session already active");
                return Ok(ConnectOutcome::AlreadyActive);
            }
            if !state.is_dead() && existing.signaling_state() == SignalingState::HaveLocalOffer {
                debug!(event = "connect_skipped", peer = %peer.short(), "Offer already outstanding");
                return Ok(ConnectOutcome::OfferPending);
            }
        }

        if self.tie_break_initiation && self.local_id >= *peer {
            debug!(
                event = "connect_deferred",
                peer = %peer.short(),
                "Peer id is lower, waiting for its offer"
            );
            return Ok(ConnectOutcome::WaitingForPeer);
        }

        self.discard(peer).await;
        let mut session = self.new_session(peer, Role::Initiator).await?;
        match self.start_offer(&mut session).await {
            Ok(()) => {
                info!(
                    event = "offer_sent",
                    peer = %peer.short(),
                    generation = session.generation(),
                    "Sent offer"
                );
                self.sessions.insert(peer.clone(), session);
                Ok(ConnectOutcome::OfferSent)
            }
            Err(e) => {
                warn!(event = "connect_failure", peer = %peer.short(), %e, "Connection attempt abandoned");
                session.close().await;
                Err(e)
            }
        }
    }

    async fn start_offer(&self, session: &mut PeerSession) -> LinkResult<()> {
        let peer = session.peer().clone();
        let engine = session.engine().clone();
        engine
            .create_data_channel(DATA_CHANNEL_LABEL)
            .await
            .map_err(|e| LinkError::negotiation(&peer, NegotiationStep::CreateDataChannel, e))?;
        let offer = engine
            .create_offer()
            .await
            .map_err(|e| LinkError::negotiation(&peer, NegotiationStep::CreateOffer, e))?;
        engine
            .set_local_description(offer.clone())
            .await
            .map_err(|e| LinkError::negotiation(&peer, NegotiationStep::SetLocalDescription, e))?;
        let envelope = SignalEnvelope::offer(&self.local_id, &offer).map_err(LinkError::Transport)?;
        self.publish(&peer, envelope).await
    }

    // ── Inbound ──────────────────────────────────────────────────────────────

    /// Process one envelope from this node's mailbox.
    pub async fn on_signal(&mut self, envelope: SignalEnvelope) -> LinkResult<SignalOutcome> {
        if envelope.from == self.local_id {
            return Ok(SignalOutcome::Ignored(IgnoreReason::FromSelf));
        }
        trace!(event = "signal_received", from = %envelope.from.short(), kind = ?envelope.kind, "Signal received");
        match envelope.kind {
            SignalKind::Offer => self.handle_offer(envelope).await,
            SignalKind::Answer => self.handle_answer(envelope).await,
            SignalKind::IceCandidate => self.handle_candidate(envelope).await,
        }
    }

    async fn handle_offer(&mut self, envelope: SignalEnvelope) -> LinkResult<SignalOutcome> {
        let from = envelope.from.clone();
        let offer = decode_description(&envelope, DescriptionKind::Offer)?;

        let mut glare = false;
        if let Some(existing) = self.sessions.get(&from) {
            let state = existing.state();
            if !state.is_dead() {
                if state == ConnectionState::Connected {
                    debug!(event = "offer_ignored", peer = %from.short(), "Already connected");
                    return Ok(SignalOutcome::Ignored(IgnoreReason::AlreadyConnected));
                }
                match existing.signaling_state() {
                    SignalingState::Stable => {
                        if existing.engine().has_remote_description().await {
                            debug!(event = "offer_ignored", peer = %from.short(), "Stale offer for negotiated session");
                            return Ok(SignalOutcome::Ignored(IgnoreReason::AlreadyNegotiated));
                        }
                    }
                    SignalingState::HaveRemoteOffer => {
                        debug!(event = "offer_ignored", peer = %from.short(), "Duplicate offer");
                        return Ok(SignalOutcome::Ignored(IgnoreReason::DuplicateOffer));
                    }
                    SignalingState::HaveLocalOffer => {
                        if self.local_id > from {
                            info!(event = "glare_kept", peer = %from.short(), "Glare: keeping our offer");
                            return Ok(SignalOutcome::GlareKept);
                        }
                        info!(event = "glare_yielded", peer = %from.short(), "Glare: discarding our offer");
                        glare = true;
                    }
                }
            }
        }

        if let Some(mut old) = self.sessions.remove(&from) {
            let stale = old.take_pending_ice();
            if !stale.is_empty() {
                debug!(event = "ice_discarded", peer = %from.short(), count = stale.len(), "Dropping candidates of the replaced session");
            }
            self.retire(old).await;
        }

        let mut session = self.new_session(&from, Role::Responder).await?;
        match self.answer_offer(&mut session, offer).await {
            Ok(()) => {
                info!(
                    event = "answer_sent",
                    peer = %from.short(),
                    generation = session.generation(),
                    glare,
                    "Answered offer"
                );
                self.sessions.insert(from, session);
                Ok(if glare {
                    SignalOutcome::AnsweredAfterGlare
                } else {
                    SignalOutcome::Answered
                })
            }
            Err(e) => {
                warn!(event = "answer_failure", peer = %from.short(), %e, "Offer handling abandoned");
                session.close().await;
                Err(e)
            }
        }
    }

    async fn answer_offer(
        &self,
        session: &mut PeerSession,
        offer: SessionDescription,
    ) -> LinkResult<()> {
        let peer = session.peer().clone();
        let engine = session.engine().clone();
        engine
            .set_remote_description(offer)
            .await
            .map_err(|e| LinkError::negotiation(&peer, NegotiationStep::SetRemoteDescription, e))?;
        session.flush_pending_ice().await;
        let answer = engine
            .create_answer()
            .await
            .map_err(|e| LinkError::negotiation(&peer, NegotiationStep::CreateAnswer, e))?;
        engine
            .set_local_description(answer.clone())
            .await
            .map_err(|e| LinkError::negotiation(&peer, NegotiationStep::SetLocalDescription, e))?;
        let envelope = SignalEnvelope::answer(&self.local_id, &answer).map_err(LinkError::Transport)?;
        self.publish(&peer, envelope).await
    }

    async fn handle_answer(&mut self, envelope: SignalEnvelope) -> LinkResult<SignalOutcome> {
        let from = envelope.from.clone();
        let Some(session) = self.sessions.get_mut(&from) else {
            debug!(event = "answer_ignored", peer = %from.short(), "No session for answer");
            return Ok(SignalOutcome::Ignored(IgnoreReason::UnknownPeer));
        };
        if session.signaling_state() != SignalingState::HaveLocalOffer {
            debug!(
                event = "answer_ignored",
                peer = %from.short(),
                state = ?session.signaling_state(),
                "Answer without outstanding offer"
            );
            return Ok(SignalOutcome::Ignored(IgnoreReason::UnexpectedAnswer));
        }

        let applied = match decode_description(&envelope, DescriptionKind::Answer) {
            Ok(answer) => session
                .engine()
                .set_remote_description(answer)
                .await
                .map_err(|e| LinkError::negotiation(&from, NegotiationStep::SetRemoteDescription, e)),
            Err(e) => Err(e),
        };
        if let Err(e) = applied {
            // Leave nothing behind so the next connect starts over.
            warn!(event = "answer_apply_failure", peer = %from.short(), %e, "Answer rejected, discarding session");
            self.discard(&from).await;
            return Err(e);
        }

        let flushed = session.flush_pending_ice().await;
        info!(event = "answer_applied", peer = %from.short(), flushed, "Applied answer");
        Ok(SignalOutcome::AnswerApplied)
    }

    async fn handle_candidate(&mut self, envelope: SignalEnvelope) -> LinkResult<SignalOutcome> {
        let from = envelope.from.clone();
        let Some(session) = self.sessions.get_mut(&from) else {
            trace!(event = "ice_dropped", peer = %from.short(), "Candidate for unknown peer");
            return Ok(SignalOutcome::Ignored(IgnoreReason::UnknownPeer));
        };
        let candidate = envelope
            .ice_candidate()
            .map_err(|e| LinkError::negotiation(&from, NegotiationStep::AddIceCandidate, e))?;
        Ok(match session.add_remote_candidate(candidate).await? {
            CandidateOutcome::Applied => SignalOutcome::CandidateApplied,
            CandidateOutcome::Buffered => SignalOutcome::CandidateBuffered,
        })
    }

    // ── Engine events ────────────────────────────────────────────────────────

    /// Consume one engine event. Events of replaced engines are dropped.
    ///
    /// An engine turning dead with its channel still open yields the state
    /// change followed by the channel close.
    pub async fn on_session_event(&mut self, ev: SessionEvent) -> Vec<SessionUpdate> {
        let SessionEvent {
            peer,
            generation,
            event,
        } = ev;
        let current = self.sessions.get(&peer).map(|s| s.generation());
        if current != Some(generation) {
            trace!(event = "engine_event_stale", peer = %peer.short(), generation, "Dropping event of replaced engine");
            return Vec::new();
        }

        if let EngineEvent::IceCandidate(candidate) = event {
            match SignalEnvelope::candidate(&self.local_id, &candidate) {
                Ok(envelope) => {
                    if let Err(e) = self.publish(&peer, envelope).await {
                        warn!(event = "ice_publish_failure", peer = %peer.short(), %e, "Failed to publish local candidate");
                    }
                }
                Err(e) => warn!(event = "ice_encode_failure", %e, "Failed to encode local candidate"),
            }
            return Vec::new();
        }

        let Some(session) = self.sessions.get_mut(&peer) else {
            return Vec::new();
        };
        match event {
            EngineEvent::IceCandidate(_) => Vec::new(),
            EngineEvent::ConnectionStateChanged(state) => {
                info!(event = "session_state", peer = %peer.short(), ?state, "Session state changed");
                if state.is_dead() && session.data_channel_open() {
                    session.set_data_channel_open(false);
                    return vec![
                        SessionUpdate::StateChanged(peer.clone(), state),
                        SessionUpdate::ChannelClosed(peer),
                    ];
                }
                vec![SessionUpdate::StateChanged(peer, state)]
            }
            EngineEvent::DataChannel(channel) => {
                debug!(event = "dc_attached", peer = %peer.short(), channel = %channel.label(), "Data channel attached");
                session.set_channel(channel);
                Vec::new()
            }
            EngineEvent::ChannelOpen => {
                if session.data_channel_open() {
                    return Vec::new();
                }
                info!(event = "dc_open", peer = %peer.short(), role = ?session.role(), "Data channel open");
                session.set_data_channel_open(true);
                vec![SessionUpdate::ChannelOpened(peer)]
            }
            EngineEvent::ChannelMessage(frame) => vec![SessionUpdate::Frame(peer, frame)],
            EngineEvent::ChannelClosed => {
                if !session.data_channel_open() {
                    return Vec::new();
                }
                info!(event = "dc_closed", peer = %peer.short(), "Data channel closed");
                session.set_data_channel_open(false);
                vec![SessionUpdate::ChannelClosed(peer)]
            }
            EngineEvent::ChannelError(e) => {
                warn!(event = "dc_error", peer = %peer.short(), error = %e, "Data channel error");
                Vec::new()
            }
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// The peer's presence record vanished. Teardown is left to [`Self::cleanup`].
    pub fn note_departure(&mut self, peer: &PeerId) {
        if let Some(session) = self.sessions.get_mut(peer) {
            info!(event = "peer_departed", peer = %peer.short(), state = ?session.state(), "Peer left the directory");
            session.mark_departed();
        }
    }

    /// The peer's presence record is back; its session is no longer a
    /// candidate for departure cleanup.
    pub fn note_return(&mut self, peer: &PeerId) {
        if let Some(session) = self.sessions.get_mut(peer) {
            if session.departed() {
                debug!(event = "peer_returned", peer = %peer.short(), state = ?session.state(), "Peer rejoined the directory");
                session.clear_departed();
            }
        }
    }

    /// Discard sessions whose engine is Failed, Disconnected or Closed, and
    /// sessions of departed peers that never got past `New`. Returns the
    /// peers whose sessions were removed.
    pub async fn cleanup(&mut self) -> Vec<PeerId> {
        let doomed: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| {
                let state = s.state();
                state.is_dead() || (s.departed() && state == ConnectionState::New)
            })
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in &doomed {
            if let Some(session) = self.sessions.remove(peer) {
                info!(
                    event = "session_cleaned",
                    peer = %peer.short(),
                    state = ?session.state(),
                    age_secs = session.age().as_secs(),
                    "Removed dead session"
                );
                self.retire(session).await;
            }
        }
        doomed
    }

    /// Peers that lost an open data channel because their session was
    /// replaced or cleaned up since the last call. Their transfers must be
    /// dropped before the peer's next session carries any traffic.
    pub fn take_closed_channels(&mut self) -> Vec<PeerId> {
        std::mem::take(&mut self.closed_channels)
    }

    /// Close every engine and forget all sessions.
    pub async fn teardown(&mut self) {
        for (peer, mut session) in self.sessions.drain() {
            debug!(event = "session_teardown", peer = %peer.short(), "Closing session");
            session.close().await;
        }
    }

    // ── Internals ────────────────────────────────────────────────────────────

    async fn new_session(&mut self, peer: &PeerId, role: Role) -> LinkResult<PeerSession> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let sink = EngineEventSink::new(peer.clone(), generation, self.events_tx.clone());
        let engine = self
            .engines
            .create(sink)
            .await
            .map_err(|e| LinkError::negotiation(peer, NegotiationStep::CreateEngine, e))?;
        debug!(event = "session_created", peer = %peer.short(), ?role, generation, "Created session");
        Ok(PeerSession::new(peer.clone(), role, generation, engine))
    }

    async fn discard(&mut self, peer: &PeerId) {
        if let Some(old) = self.sessions.remove(peer) {
            debug!(event = "session_replaced", peer = %peer.short(), state = ?old.state(), "Discarding previous session");
            self.retire(old).await;
        }
    }

    /// Close a session already removed from the table, remembering its peer
    /// if the data channel was still considered open.
    async fn retire(&mut self, mut session: PeerSession) {
        if session.data_channel_open() {
            info!(event = "dc_closed", peer = %session.peer().short(), generation = session.generation(), "Data channel closed with its session");
            self.closed_channels.push(session.peer().clone());
        }
        session.close().await;
    }

    async fn publish(&self, to: &PeerId, envelope: SignalEnvelope) -> LinkResult<()> {
        let raw = envelope.encode().map_err(LinkError::Transport)?;
        self.transport
            .push(&signals_namespace(to), raw)
            .await
            .map_err(LinkError::Transport)?;
        Ok(())
    }
}

fn decode_description(
    envelope: &SignalEnvelope,
    expected: DescriptionKind,
) -> LinkResult<SessionDescription> {
    let desc = envelope
        .description()
        .map_err(|e| LinkError::negotiation(&envelope.from, NegotiationStep::SetRemoteDescription, e))?;
    if desc.kind != expected {
        return Err(LinkError::negotiation(
            &envelope.from,
            NegotiationStep::SetRemoteDescription,
            anyhow!("expected {expected:?}, got {:?}", desc.kind),
        ));
    }
    Ok(desc)
}
