//! WebRTC-backed connection engine (webrtc-rs).
//!
//! # Event wiring
//!
//! - `on_peer_connection_state_change` → [`EngineEvent::ConnectionStateChanged`]
//! - `on_ice_candidate` → [`EngineEvent::IceCandidate`] (trickle ICE)
//! - `on_data_channel` / local `create_data_channel` → [`EngineEvent::DataChannel`]
//! - data channel `on_open` / `on_message` / `on_close` / `on_error` → channel events
//!
//! One reliable, ordered data channel carries both JSON text frames and raw
//! binary chunk frames.

mod channel;

pub use channel::WebRtcChannel;

use super::{
    ConnectionEngine, ConnectionState, DescriptionKind, EngineEvent, EngineEventSink,
    EngineFactory, IceCandidate, SessionDescription, SignalingState,
};
use crate::core::config::{DEFAULT_STUN_SERVER, ICE_USE_LOOPBACK};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

// ── Factory ──────────────────────────────────────────────────────────────────

/// Shares one webrtc-rs API object across every session it creates.
pub struct WebRtcEngineFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngineFactory {
    /// Factory using the given STUN/TURN urls, or the default STUN server
    /// when `urls` is empty.
    pub fn new(urls: Vec<String>) -> Result<Self> {
        let urls = if urls.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            urls
        };
        Ok(Self {
            api: Self::create_webrtc_api()?,
            ice_servers: vec![RTCIceServer {
                urls,
                ..Default::default()
            }],
        })
    }

    fn create_webrtc_api() -> Result<API> {
        let mut me = MediaEngine::default();
        let reg = register_default_interceptors(Registry::new(), &mut me)?;

        let mut se = SettingEngine::default();
        se.set_include_loopback_candidate(ICE_USE_LOOPBACK);

        Ok(APIBuilder::new()
            .with_setting_engine(se)
            .with_media_engine(me)
            .with_interceptor_registry(reg)
            .build())
    }
}

#[async_trait]
impl EngineFactory for WebRtcEngineFactory {
    async fn create(&self, sink: EngineEventSink) -> Result<Arc<dyn ConnectionEngine>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: self.ice_servers.clone(),
                    ..Default::default()
                })
                .await?,
        );
        WebRtcEngine::wire(&pc, &sink);
        Ok(Arc::new(WebRtcEngine { pc, sink }))
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    sink: EngineEventSink,
}

impl WebRtcEngine {
    /// Route peer-connection callbacks into `sink`.
    fn wire(pc: &Arc<RTCPeerConnection>, sink: &EngineEventSink) {
        let tx = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |s| {
            let tx = tx.clone();
            Box::pin(async move {
                let peer = tx.peer().short().to_string();
                match s {
                    RTCPeerConnectionState::Connected => {
                        info!(event = "webrtc_connected", %peer, "WebRTC connection established");
                    }
                    RTCPeerConnectionState::Failed => {
                        error!(event = "webrtc_failed", %peer, "WebRTC connection failed");
                    }
                    RTCPeerConnectionState::Disconnected => {
                        warn!(event = "webrtc_disconnected", %peer, "WebRTC transient disconnect");
                    }
                    RTCPeerConnectionState::Closed => {
                        info!(event = "webrtc_closed", %peer, "WebRTC connection closed");
                    }
                    _ => {}
                }
                tx.emit(EngineEvent::ConnectionStateChanged(map_connection_state(s)));
            })
        }));

        let tx = sink.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(c) = c else { return };
                match c.to_json() {
                    Ok(init) => {
                        tx.emit(EngineEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => {
                        warn!(event = "ice_candidate_encode_failure", %e, "Dropping local ICE candidate");
                    }
                }
            })
        }));

        let tx = sink.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let tx = tx.clone();
            Box::pin(async move {
                debug!(event = "dc_announced", channel = %dc.label(), "Remote data channel announced");
                let channel = WebRtcChannel::attach(dc, &tx);
                tx.emit(EngineEvent::DataChannel(channel));
            })
        }));
    }
}

#[async_trait]
impl ConnectionEngine for WebRtcEngine {
    async fn create_data_channel(&self, label: &str) -> Result<()> {
        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        let channel = WebRtcChannel::attach(dc, &self.sink);
        self.sink.emit(EngineEvent::DataChannel(channel));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription {
            kind: DescriptionKind::Offer,
            sdp: offer.sdp,
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription {
            kind: DescriptionKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            _ => SignalingState::Stable,
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| anyhow!("Failed to close peer connection: {e}"))
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    Ok(match desc.kind {
        DescriptionKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        DescriptionKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    })
}

fn map_connection_state(s: RTCPeerConnectionState) -> ConnectionState {
    match s {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}
