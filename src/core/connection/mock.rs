//! Deterministic in-memory engine for tests.
//!
//! Engines created from factories of the same [`MockNetwork`] can find each
//! other: an offer carries the offering engine's id, an answer the answering
//! engine's id, and applying an answer links both sides with a channel pair
//! that delivers frames as [`EngineEvent::ChannelMessage`] on the other side.

use super::{
    ConnectionEngine, ConnectionState, DataChannel, DescriptionKind, EngineEvent, EngineEventSink,
    EngineFactory, Frame, IceCandidate, SessionDescription, SignalingState,
};
use crate::core::peer::PeerId;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Default)]
struct NetState {
    next_id: u64,
    engines: HashMap<u64, Weak<MockEngine>>,
    failing_candidates: HashSet<String>,
}

#[derive(Clone, Default)]
pub(crate) struct MockNetwork {
    inner: Arc<Mutex<NetState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<MockEngineFactory> {
        Arc::new(MockEngineFactory {
            net: self.clone(),
            created: Mutex::new(Vec::new()),
        })
    }

    /// Make `add_ice_candidate` reject this candidate string on every engine.
    pub fn fail_candidate(&self, candidate: &str) {
        self.inner
            .lock()
            .unwrap()
            .failing_candidates
            .insert(candidate.to_string());
    }

    fn candidate_fails(&self, candidate: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .failing_candidates
            .contains(candidate)
    }

    fn lookup(&self, id: u64) -> Option<Arc<MockEngine>> {
        self.inner.lock().unwrap().engines.get(&id)?.upgrade()
    }
}

pub(crate) struct MockEngineFactory {
    net: MockNetwork,
    created: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockEngineFactory {
    /// Most recent engine created for `peer`.
    pub fn latest(&self, peer: &PeerId) -> Option<Arc<MockEngine>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.sink.peer() == peer)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl EngineFactory for MockEngineFactory {
    async fn create(&self, sink: EngineEventSink) -> Result<Arc<dyn ConnectionEngine>> {
        let engine = {
            let mut net = self.net.inner.lock().unwrap();
            net.next_id += 1;
            let engine = Arc::new(MockEngine {
                id: net.next_id,
                sink,
                net: self.net.clone(),
                state: Mutex::new(MockState::default()),
                local_channel: Mutex::new(None),
            });
            net.engines.insert(engine.id, Arc::downgrade(&engine));
            engine
        };
        self.created.lock().unwrap().push(engine.clone());
        Ok(engine)
    }
}

struct MockState {
    connection: ConnectionState,
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    offers_created: usize,
    closed: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::New,
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            applied: Vec::new(),
            offers_created: 0,
            closed: false,
        }
    }
}

pub(crate) struct MockEngine {
    id: u64,
    sink: EngineEventSink,
    net: MockNetwork,
    state: Mutex<MockState>,
    local_channel: Mutex<Option<Arc<MockChannel>>>,
}

impl MockEngine {
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .applied
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().unwrap().offers_created
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Force a connection state, reporting it like a real engine would.
    pub fn force_state(&self, s: ConnectionState) {
        self.state.lock().unwrap().connection = s;
        self.sink.emit(EngineEvent::ConnectionStateChanged(s));
    }

    /// Close the initiator's channel without reporting it.
    pub fn sever_channel(&self) {
        if let Some(ch) = self.local_channel.lock().unwrap().as_ref() {
            ch.open.store(false, Ordering::Release);
        }
    }

    fn set_connection(&self, s: ConnectionState) {
        self.state.lock().unwrap().connection = s;
        self.sink.emit(EngineEvent::ConnectionStateChanged(s));
    }

    fn parse_id(sdp: &str, prefix: &str) -> Result<u64> {
        sdp.strip_prefix(prefix)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| anyhow!("malformed session description: {sdp}"))
    }

    /// Called on the initiator once the answer is applied.
    fn link(&self, answerer: &Arc<MockEngine>) {
        let open = Arc::new(AtomicBool::new(true));
        let ours = self
            .local_channel
            .lock()
            .unwrap()
            .clone();
        if let Some(ours) = &ours {
            *ours.remote.lock().unwrap() = Some(answerer.sink.clone());
            ours.open.store(true, Ordering::Release);
        }
        let theirs = Arc::new(MockChannel {
            remote: Mutex::new(Some(self.sink.clone())),
            open,
        });

        self.set_connection(ConnectionState::Connected);
        answerer.set_connection(ConnectionState::Connected);

        answerer.sink.emit(EngineEvent::DataChannel(theirs));
        if ours.is_some() {
            self.sink.emit(EngineEvent::ChannelOpen);
        }
        answerer.sink.emit(EngineEvent::ChannelOpen);
    }
}

#[async_trait]
impl ConnectionEngine for MockEngine {
    async fn create_data_channel(&self, _label: &str) -> Result<()> {
        let channel = Arc::new(MockChannel {
            remote: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
        });
        *self.local_channel.lock().unwrap() = Some(channel.clone());
        self.sink.emit(EngineEvent::DataChannel(channel));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            bail!("engine closed");
        }
        st.offers_created += 1;
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: format!("mock-offer:{}", self.id),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let st = self.state.lock().unwrap();
        if st.signaling != SignalingState::HaveRemoteOffer {
            bail!("create_answer in {:?}", st.signaling);
        }
        Ok(SessionDescription {
            kind: DescriptionKind::Answer,
            sdp: format!("mock-answer:{}", self.id),
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        {
            let mut st = self.state.lock().unwrap();
            match (desc.kind, st.signaling) {
                (DescriptionKind::Offer, SignalingState::Stable) => {
                    st.signaling = SignalingState::HaveLocalOffer;
                }
                (DescriptionKind::Answer, SignalingState::HaveRemoteOffer) => {
                    st.signaling = SignalingState::Stable;
                    st.connection = ConnectionState::Connecting;
                }
                (kind, s) => bail!("set_local_description({kind:?}) in {s:?}"),
            }
            st.local = Some(desc);
        }
        self.sink.emit(EngineEvent::IceCandidate(IceCandidate {
            candidate: format!("host-{}", self.id),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let answerer = {
            let mut st = self.state.lock().unwrap();
            match (desc.kind, st.signaling) {
                (DescriptionKind::Offer, SignalingState::Stable) => {
                    Self::parse_id(&desc.sdp, "mock-offer:")?;
                    st.signaling = SignalingState::HaveRemoteOffer;
                    st.remote = Some(desc);
                    None
                }
                (DescriptionKind::Answer, SignalingState::HaveLocalOffer) => {
                    let id = Self::parse_id(&desc.sdp, "mock-answer:")?;
                    st.signaling = SignalingState::Stable;
                    st.remote = Some(desc);
                    Some(id)
                }
                (kind, s) => bail!("set_remote_description({kind:?}) in {s:?}"),
            }
        };
        if let Some(id) = answerer {
            if let Some(other) = self.net.lookup(id) {
                self.link(&other);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.net.candidate_fails(&candidate.candidate) {
            bail!("rejected candidate {}", candidate.candidate);
        }
        let mut st = self.state.lock().unwrap();
        if st.remote.is_none() {
            bail!("candidate before remote description");
        }
        st.applied.push(candidate);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().connection
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().unwrap().signaling
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().unwrap().remote.is_some()
    }

    async fn close(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.closed = true;
        st.connection = ConnectionState::Closed;
        Ok(())
    }
}

pub(crate) struct MockChannel {
    remote: Mutex<Option<EngineEventSink>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        "mock"
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            bail!("channel not open");
        }
        let remote = self.remote.lock().unwrap().clone();
        match remote {
            Some(sink) if sink.emit(EngineEvent::ChannelMessage(frame)) => Ok(()),
            _ => Err(anyhow!("remote side gone")),
        }
    }
}

/// Standalone channel whose sent frames land in a local queue.
pub(crate) struct RecordingChannel {
    pub sent: Mutex<Vec<Frame>>,
    pub open: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    /// Take every frame sent so far.
    pub fn drain(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl DataChannel for RecordingChannel {
    fn label(&self) -> &str {
        "recording"
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            bail!("channel closed");
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }
}
