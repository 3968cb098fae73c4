//! Node runtime.
//!
//! A [`Node`] publishes this device's presence, subscribes to its signal
//! mailbox and to the device list, and runs one loop that owns the session
//! manager, the transfer controller and the directory. Everything reaches that
//! loop as a message, so the tables are never shared:
//!
//! - application commands from [`NodeHandle`]
//! - signal envelopes, one at a time, in mailbox order
//! - presence changes
//! - engine events (tagged with the session generation that produced them)
//! - cleanup and presence-refresh ticks
//!
//! The application hears back through [`NodeEvent`]s.

use crate::core::config::NodeConfig;
use crate::core::connection::{ConnectionState, EngineFactory, Frame, SessionEvent};
use crate::core::directory::{DeviceDirectory, PresenceChange};
use crate::core::error::{LinkError, LinkResult};
use crate::core::manager::{ConnectOutcome, PeerSessionManager, SessionUpdate};
use crate::core::peer::{now_millis, PeerId};
use crate::core::protocol::{self, ChannelMessage, Inbound};
use crate::core::signaling::{
    devices_namespace, signals_namespace, ChildEvent, PresenceRecord, SignalEnvelope,
    SignalTransport, Subscription,
};
use crate::core::transfer::{FileTransfer, TransferController, TransferEvent, TransferSettings};
use crate::utils::sos::SignalOfStop;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Events delivered to the application.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The set of remote devices changed.
    PeersChanged(Vec<PresenceRecord>),
    /// The data channel to `peer` is open.
    Connected(PeerId),
    /// The data channel to `peer` closed or its session died.
    Disconnected(PeerId),
    ConnectionState {
        peer: PeerId,
        state: ConnectionState,
    },
    Chat {
        from: PeerId,
        text: String,
        sent_at: u64,
    },
    Transfer(TransferEvent),
}

/// Forward `event` to the application; a gone receiver is not an error.
#[inline]
fn notify_app(app_tx: &mpsc::UnboundedSender<NodeEvent>, event: NodeEvent) {
    let _ = app_tx.send(event);
}

enum Command {
    Connect {
        peer: PeerId,
        reply: oneshot::Sender<LinkResult<ConnectOutcome>>,
    },
    SendChat {
        peer: PeerId,
        text: String,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    OfferFile {
        peer: PeerId,
        name: String,
        data: Bytes,
        reply: oneshot::Sender<LinkResult<FileTransfer>>,
    },
    RespondToOffer {
        transfer_id: String,
        accept: bool,
        reply: oneshot::Sender<LinkResult<()>>,
    },
    IsConnected {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    ConnectionStateOf {
        peer: PeerId,
        reply: oneshot::Sender<Option<ConnectionState>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PresenceRecord>>,
    },
}

/// Cheap, cloneable front door to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    local_id: PeerId,
    commands: mpsc::UnboundedSender<Command>,
}

impl NodeHandle {
    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> LinkResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| LinkError::NodeStopped)?;
        rx.await.map_err(|_| LinkError::NodeStopped)
    }

    pub async fn connect(&self, peer: &PeerId) -> LinkResult<ConnectOutcome> {
        let peer = peer.clone();
        self.request(|reply| Command::Connect { peer, reply }).await?
    }

    pub async fn send_chat(&self, peer: &PeerId, text: impl Into<String>) -> LinkResult<()> {
        let (peer, text) = (peer.clone(), text.into());
        self.request(|reply| Command::SendChat { peer, text, reply })
            .await?
    }

    pub async fn offer_file(
        &self,
        peer: &PeerId,
        name: impl Into<String>,
        data: Bytes,
    ) -> LinkResult<FileTransfer> {
        let (peer, name) = (peer.clone(), name.into());
        self.request(|reply| Command::OfferFile {
            peer,
            name,
            data,
            reply,
        })
        .await?
    }

    pub async fn respond_to_offer(&self, transfer_id: &str, accept: bool) -> LinkResult<()> {
        let transfer_id = transfer_id.to_string();
        self.request(|reply| Command::RespondToOffer {
            transfer_id,
            accept,
            reply,
        })
        .await?
    }

    pub async fn is_connected(&self, peer: &PeerId) -> LinkResult<bool> {
        let peer = peer.clone();
        self.request(|reply| Command::IsConnected { peer, reply })
            .await
    }

    pub async fn connection_state_of(&self, peer: &PeerId) -> LinkResult<Option<ConnectionState>> {
        let peer = peer.clone();
        self.request(|reply| Command::ConnectionStateOf { peer, reply })
            .await
    }

    pub async fn peers(&self) -> LinkResult<Vec<PresenceRecord>> {
        self.request(|reply| Command::Peers { reply }).await
    }
}

pub struct Node {
    handle: NodeHandle,
    sos: SignalOfStop,
    task: JoinHandle<()>,
}

impl Node {
    /// Publish presence, subscribe to the relay and spawn the node loop.
    pub async fn start(
        local_id: PeerId,
        config: NodeConfig,
        transport: Arc<dyn SignalTransport>,
        engines: Arc<dyn EngineFactory>,
    ) -> LinkResult<(Self, mpsc::UnboundedReceiver<NodeEvent>)> {
        publish_presence(&*transport, &local_id, &config.display_name).await?;
        transport
            .remove_on_disconnect(devices_namespace(), local_id.as_str())
            .await
            .map_err(LinkError::Transport)?;
        let signals = transport
            .subscribe(&signals_namespace(&local_id))
            .await
            .map_err(LinkError::Transport)?;
        let devices = transport
            .subscribe(devices_namespace())
            .await
            .map_err(LinkError::Transport)?;

        let (sessions, session_events) = PeerSessionManager::new(
            local_id.clone(),
            transport.clone(),
            engines,
            config.tie_break_initiation,
        );
        let (transfer_tx, transfer_events) = mpsc::unbounded_channel();
        let transfers =
            TransferController::new(local_id.clone(), TransferSettings::from(&config), transfer_tx);
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (cmd_tx, commands) = mpsc::unbounded_channel();

        let sos = SignalOfStop::new();
        let runtime = NodeRuntime {
            local_id: local_id.clone(),
            directory: DeviceDirectory::new(local_id.clone()),
            config,
            transport,
            sessions,
            transfers,
            app_tx,
        };
        let feeds = Feeds {
            commands,
            signals,
            devices,
            session_events,
            transfer_events,
        };
        let task = tokio::spawn(runtime.run(feeds, sos.clone()));

        info!(event = "node_started", peer = %local_id, "Node started");
        Ok((
            Self {
                handle: NodeHandle {
                    local_id,
                    commands: cmd_tx,
                },
                sos,
                task,
            },
            app_rx,
        ))
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn local_id(&self) -> &PeerId {
        &self.handle.local_id
    }

    /// Stop the loop, close every engine, withdraw presence and leave the relay.
    pub async fn teardown(self) {
        self.sos.cancel();
        if let Err(e) = self.task.await {
            warn!(event = "node_join_failure", %e, "Node loop ended abnormally");
        }
    }
}

async fn publish_presence(
    transport: &dyn SignalTransport,
    local_id: &PeerId,
    display_name: &str,
) -> LinkResult<()> {
    let record = PresenceRecord::new(local_id.clone(), display_name);
    let raw = serde_json::to_string(&record).map_err(|e| LinkError::Transport(e.into()))?;
    transport
        .put(devices_namespace(), local_id.as_str(), raw)
        .await
        .map_err(LinkError::Transport)
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut t = interval_at(Instant::now() + period, period);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

// ── Loop ─────────────────────────────────────────────────────────────────────

struct Feeds {
    commands: mpsc::UnboundedReceiver<Command>,
    signals: Subscription,
    devices: Subscription,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    transfer_events: mpsc::UnboundedReceiver<TransferEvent>,
}

struct NodeRuntime {
    local_id: PeerId,
    config: NodeConfig,
    transport: Arc<dyn SignalTransport>,
    sessions: PeerSessionManager,
    transfers: TransferController,
    directory: DeviceDirectory,
    app_tx: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeRuntime {
    async fn run(mut self, mut feeds: Feeds, sos: SignalOfStop) {
        let mut cleanup = ticker(self.config.cleanup_interval);
        let mut refresh = ticker(self.config.presence_refresh_interval);

        loop {
            tokio::select! {
                _ = sos.wait() => break,
                cmd = feeds.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                ev = feeds.signals.recv() => match ev {
                    Some(ChildEvent::Added { key, value }) => self.handle_signal(&key, &value).await,
                    Some(_) => {}
                    None => {
                        warn!(event = "signal_feed_closed", "Signal subscription ended");
                        break;
                    }
                },
                ev = feeds.devices.recv() => match ev {
                    Some(ev) => self.handle_presence(ev),
                    None => {
                        warn!(event = "presence_feed_closed", "Device subscription ended");
                        break;
                    }
                },
                Some(ev) = feeds.session_events.recv() => self.handle_session_event(ev).await,
                Some(ev) = feeds.transfer_events.recv() => {
                    notify_app(&self.app_tx, NodeEvent::Transfer(ev));
                }
                _ = cleanup.tick() => self.cleanup().await,
                _ = refresh.tick() => self.refresh_presence().await,
            }
        }

        self.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { peer, reply } => {
                let result = self.sessions.connect(&peer).await;
                self.reap_closed_channels().await;
                let _ = reply.send(result);
            }
            Command::SendChat { peer, text, reply } => {
                let _ = reply.send(self.send_chat(&peer, text).await);
            }
            Command::OfferFile {
                peer,
                name,
                data,
                reply,
            } => {
                let result = match self.sessions.channel_of(&peer) {
                    Some(channel) => {
                        self.transfers
                            .offer_file(&peer, channel, &name, data)
                            .await
                    }
                    None => Err(LinkError::ChannelUnavailable(peer)),
                };
                let _ = reply.send(result);
            }
            Command::RespondToOffer {
                transfer_id,
                accept,
                reply,
            } => {
                let _ = reply.send(self.respond(&transfer_id, accept).await);
            }
            Command::IsConnected { peer, reply } => {
                let _ = reply.send(self.sessions.is_connected(&peer));
            }
            Command::ConnectionStateOf { peer, reply } => {
                let _ = reply.send(self.sessions.connection_state_of(&peer));
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.directory.peers());
            }
        }
    }

    async fn send_chat(&mut self, peer: &PeerId, text: String) -> LinkResult<()> {
        let channel = self
            .sessions
            .channel_of(peer)
            .ok_or_else(|| LinkError::ChannelUnavailable(peer.clone()))?;
        let frame = ChannelMessage::ChatMessage {
            text,
            sent_at: now_millis(),
        }
        .to_frame()?;
        channel.send(frame).await.map_err(|e| {
            warn!(event = "chat_send_failure", peer = %peer.short(), %e, "Chat send failed");
            LinkError::ChannelUnavailable(peer.clone())
        })
    }

    async fn respond(&mut self, transfer_id: &str, accept: bool) -> LinkResult<()> {
        let peer = self
            .transfers
            .incoming_peer(transfer_id)
            .ok_or_else(|| LinkError::UnknownTransfer(transfer_id.to_string()))?;
        let channel = self
            .sessions
            .channel_of(&peer)
            .ok_or(LinkError::ChannelUnavailable(peer))?;
        self.transfers.respond(transfer_id, accept, &channel).await
    }

    /// Apply one envelope, then delete it from the mailbox whatever happened.
    async fn handle_signal(&mut self, key: &str, raw: &str) {
        match SignalEnvelope::decode(raw) {
            Ok(envelope) => {
                let from = envelope.from.clone();
                let kind = envelope.kind;
                match self.sessions.on_signal(envelope).await {
                    Ok(outcome) => {
                        debug!(event = "signal_processed", from = %from.short(), ?kind, ?outcome, "Signal processed");
                    }
                    Err(e) => {
                        warn!(event = "signal_failure", from = %from.short(), ?kind, %e, "Signal handling failed");
                    }
                }
            }
            Err(e) => warn!(event = "signal_malformed", %key, %e, "Discarding unreadable signal"),
        }
        self.reap_closed_channels().await;

        if let Err(e) = self
            .transport
            .remove(&signals_namespace(&self.local_id), key)
            .await
        {
            warn!(event = "signal_remove_failure", %key, %e, "Failed to delete processed signal");
        }
    }

    fn handle_presence(&mut self, ev: ChildEvent) {
        match self.directory.apply(ev) {
            PresenceChange::Ignored => return,
            PresenceChange::Departed(peer) => self.sessions.note_departure(&peer),
            PresenceChange::Joined(peer) => self.sessions.note_return(&peer),
            PresenceChange::Updated(_) => {}
        }
        notify_app(&self.app_tx, NodeEvent::PeersChanged(self.directory.peers()));
    }

    async fn handle_session_event(&mut self, ev: SessionEvent) {
        for update in self.sessions.on_session_event(ev).await {
            match update {
                SessionUpdate::ChannelOpened(peer) => {
                    info!(
                        event = "peer_linked",
                        peer = %peer.short(),
                        name = self.directory.display_name_of(&peer).unwrap_or("unknown"),
                        "Linked to peer"
                    );
                    notify_app(&self.app_tx, NodeEvent::Connected(peer));
                }
                SessionUpdate::ChannelClosed(peer) => self.channel_closed(peer).await,
                SessionUpdate::StateChanged(peer, state) => {
                    notify_app(&self.app_tx, NodeEvent::ConnectionState { peer, state });
                }
                SessionUpdate::Frame(peer, frame) => self.handle_frame(peer, frame).await,
            }
        }
    }

    async fn channel_closed(&mut self, peer: PeerId) {
        self.transfers.session_closed(&peer).await;
        notify_app(&self.app_tx, NodeEvent::Disconnected(peer));
    }

    /// Report channels that closed because their session was replaced or
    /// swept. Runs before the next event, so a new session never inherits
    /// the old one's transfers.
    async fn reap_closed_channels(&mut self) {
        for peer in self.sessions.take_closed_channels() {
            self.channel_closed(peer).await;
        }
    }

    async fn handle_frame(&mut self, peer: PeerId, frame: Frame) {
        let result = match protocol::decode(frame) {
            Ok(Inbound::Control(ChannelMessage::ChatMessage { text, sent_at })) => {
                debug!(event = "chat_received", peer = %peer.short(), len = text.len(), "Chat received");
                notify_app(
                    &self.app_tx,
                    NodeEvent::Chat {
                        from: peer.clone(),
                        text,
                        sent_at,
                    },
                );
                Ok(())
            }
            Ok(Inbound::Control(msg)) => match self.sessions.channel_of(&peer) {
                Some(channel) => self.transfers.handle_control(&peer, &channel, msg).await,
                None => Err(LinkError::ChannelUnavailable(peer.clone())),
            },
            Ok(Inbound::Chunk(data)) => self.transfers.handle_chunk(&peer, data),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(event = "frame_discarded", peer = %peer.short(), %e, "Discarded data channel frame");
        }
    }

    async fn cleanup(&mut self) {
        for peer in self.sessions.cleanup().await {
            self.transfers.session_closed(&peer).await;
        }
        self.reap_closed_channels().await;

        let stale = self
            .directory
            .sweep_stale(now_millis(), self.config.presence_stale_after);
        if stale.is_empty() {
            return;
        }
        for peer in &stale {
            if let Err(e) = self
                .transport
                .remove(devices_namespace(), peer.as_str())
                .await
            {
                warn!(event = "presence_remove_failure", peer = %peer.short(), %e, "Failed to remove stale presence");
            }
            self.sessions.note_departure(peer);
        }
        notify_app(&self.app_tx, NodeEvent::PeersChanged(self.directory.peers()));
    }

    async fn refresh_presence(&mut self) {
        if let Err(e) =
            publish_presence(&*self.transport, &self.local_id, &self.config.display_name).await
        {
            warn!(event = "presence_refresh_failure", %e, "Failed to refresh presence");
        }
    }

    async fn shutdown(&mut self) {
        self.sessions.teardown().await;
        if let Err(e) = self
            .transport
            .remove(devices_namespace(), self.local_id.as_str())
            .await
        {
            warn!(event = "presence_remove_failure", %e, "Failed to withdraw presence");
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(event = "relay_disconnect_failure", %e, "Failed to leave relay");
        }
        info!(event = "node_stopped", peer = %self.local_id, "Node stopped");
    }
}
