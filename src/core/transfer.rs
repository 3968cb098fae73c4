//! File transfer over an open data channel.
//!
//! # Sender
//!
//! `Offered → Accepted → InProgress → Completed`, or `Declined` / `TimedOut`,
//! or `Failed` when the channel goes away. After the metadata frame is sent a
//! spawned task waits on a one-shot waiter keyed by transfer id, then streams
//! the chunks. Whoever removes the waiter from the table owns the outcome, so
//! an offer resolves exactly once even when a response races the deadline.
//!
//! # Receiver
//!
//! `Offered → Accepted → InProgress → Completed`, or `Declined`. Binary frames
//! are appended in arrival order to the single inbound transfer of that peer;
//! the transfer completes when the frame count reaches the total derived from
//! the announced size and chunk size.
//!
//! One outbound and one inbound transfer per peer at a time.

use crate::core::config::{NodeConfig, MAX_CHUNK_SIZE};
use crate::core::connection::{DataChannel, Frame};
use crate::core::error::{LinkError, LinkResult};
use crate::core::peer::{now_millis, PeerId};
use crate::core::protocol::{total_chunks, ChannelMessage};
use bytes::{Bytes, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Offered,
    Accepted,
    Declined,
    InProgress,
    Completed,
    TimedOut,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Declined | Self::Completed | Self::TimedOut | Self::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub transfer_id: String,
    pub peer: PeerId,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub chunk_size: u64,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    /// Chunks received (inbound) or sent (outbound) so far.
    pub received_chunks: u64,
    pub total_chunks: u64,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A peer offered a file; answer with [`TransferController::respond`].
    IncomingOffer(FileTransfer),
    Status {
        transfer_id: String,
        peer: PeerId,
        direction: TransferDirection,
        status: TransferStatus,
    },
    Progress {
        transfer_id: String,
        peer: PeerId,
        direction: TransferDirection,
        done: u64,
        total: u64,
    },
    /// An inbound transfer finished; `data` is the reassembled file.
    Received { transfer: FileTransfer, data: Bytes },
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub offer_timeout: Duration,
    pub chunk_delay: Duration,
}

impl From<&NodeConfig> for TransferSettings {
    fn from(cfg: &NodeConfig) -> Self {
        Self {
            chunk_size: cfg.chunk_size.clamp(1, MAX_CHUNK_SIZE),
            offer_timeout: cfg.offer_timeout,
            chunk_delay: cfg.chunk_delay,
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from(&NodeConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OfferResponse {
    Accepted,
    Declined,
}

/// Shared between the owner and the per-transfer sender tasks.
#[derive(Default)]
struct OutboundState {
    /// Active outbound transfer id per peer.
    slots: HashMap<PeerId, String>,
    waiters: HashMap<String, oneshot::Sender<OfferResponse>>,
}

struct IncomingTransfer {
    transfer: FileTransfer,
    chunks: Vec<Bytes>,
}

pub struct TransferController {
    local_id: PeerId,
    settings: TransferSettings,
    outbound: Arc<Mutex<OutboundState>>,
    inbound: HashMap<PeerId, IncomingTransfer>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferController {
    pub fn new(
        local_id: PeerId,
        settings: TransferSettings,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            local_id,
            settings,
            outbound: Arc::new(Mutex::new(OutboundState::default())),
            inbound: HashMap::new(),
            events,
        }
    }

    #[cfg(test)]
    pub(crate) async fn outbound_active(&self, peer: &PeerId) -> bool {
        self.outbound.lock().await.slots.contains_key(peer)
    }

    pub fn inbound_of(&self, peer: &PeerId) -> Option<&FileTransfer> {
        self.inbound.get(peer).map(|t| &t.transfer)
    }

    /// Peer that offered the inbound transfer `transfer_id`.
    pub fn incoming_peer(&self, transfer_id: &str) -> Option<PeerId> {
        self.inbound
            .iter()
            .find(|(_, t)| t.transfer.transfer_id == transfer_id)
            .map(|(peer, _)| peer.clone())
    }

    // ── Sender ───────────────────────────────────────────────────────────────

    /// Send the metadata for `data` to `peer` and start waiting for its answer.
    pub async fn offer_file(
        &mut self,
        peer: &PeerId,
        channel: Arc<dyn DataChannel>,
        name: &str,
        data: Bytes,
    ) -> LinkResult<FileTransfer> {
        let chunk_size = self.settings.chunk_size as u64;
        let size = data.len() as u64;
        let transfer = FileTransfer {
            transfer_id: new_transfer_id(&self.local_id),
            peer: peer.clone(),
            name: name.to_string(),
            size,
            mime_type: mime_type_for(name),
            chunk_size,
            direction: TransferDirection::Outgoing,
            status: TransferStatus::Offered,
            received_chunks: 0,
            total_chunks: total_chunks(size, chunk_size),
        };
        let metadata = ChannelMessage::FileMetadata {
            transfer_id: transfer.transfer_id.clone(),
            name: transfer.name.clone(),
            size,
            mime_type: transfer.mime_type.clone(),
            chunk_size,
        }
        .to_frame()?;

        let (tx, rx) = oneshot::channel();
        {
            let mut out = self.outbound.lock().await;
            if out.slots.contains_key(peer) {
                return Err(LinkError::TransferBusy(peer.clone()));
            }
            out.slots.insert(peer.clone(), transfer.transfer_id.clone());
            out.waiters.insert(transfer.transfer_id.clone(), tx);
        }

        if let Err(e) = channel.send(metadata).await {
            warn!(event = "offer_send_failure", peer = %peer.short(), %e, "Failed to send file metadata");
            release(&self.outbound, peer, &transfer.transfer_id).await;
            return Err(LinkError::ChannelUnavailable(peer.clone()));
        }

        info!(
            event = "file_offered",
            transfer_id = %transfer.transfer_id,
            peer = %peer.short(),
            name = %transfer.name,
            size,
            chunks = transfer.total_chunks,
            "Offered file"
        );
        notify(&self.events, status_event(&transfer));

        tokio::spawn(drive_outbound(OutboundTask {
            transfer: transfer.clone(),
            data,
            channel,
            response: rx,
            outbound: self.outbound.clone(),
            events: self.events.clone(),
            settings: self.settings.clone(),
        }));
        Ok(transfer)
    }

    // ── Receiver / control ───────────────────────────────────────────────────

    /// Handle a transfer control message from `peer`. Responses that match no
    /// waiting offer of that peer are ignored.
    pub async fn handle_control(
        &mut self,
        peer: &PeerId,
        channel: &Arc<dyn DataChannel>,
        msg: ChannelMessage,
    ) -> LinkResult<()> {
        match msg {
            ChannelMessage::FileMetadata {
                transfer_id,
                name,
                size,
                mime_type,
                chunk_size,
            } => {
                if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE as u64 {
                    return Err(LinkError::ProtocolViolation(format!(
                        "transfer {transfer_id}: chunk size {chunk_size} out of range"
                    )));
                }
                if let Some(active) = self.inbound.get(peer) {
                    if active.transfer.transfer_id == transfer_id {
                        debug!(event = "offer_duplicate", %transfer_id, "Repeated metadata ignored");
                        return Ok(());
                    }
                    info!(
                        event = "offer_auto_declined",
                        peer = %peer.short(),
                        transfer_id = %transfer_id,
                        active = %active.transfer.transfer_id,
                        "Inbound transfer already active, declining"
                    );
                    let frame = ChannelMessage::FileDeclined { transfer_id }.to_frame()?;
                    return channel
                        .send(frame)
                        .await
                        .map_err(|_| LinkError::ChannelUnavailable(peer.clone()));
                }

                let transfer = FileTransfer {
                    transfer_id,
                    peer: peer.clone(),
                    name,
                    size,
                    mime_type,
                    chunk_size,
                    direction: TransferDirection::Incoming,
                    status: TransferStatus::Offered,
                    received_chunks: 0,
                    total_chunks: total_chunks(size, chunk_size),
                };
                info!(
                    event = "file_offer_received",
                    transfer_id = %transfer.transfer_id,
                    peer = %peer.short(),
                    name = %transfer.name,
                    size,
                    "Received file offer"
                );
                notify(&self.events, TransferEvent::IncomingOffer(transfer.clone()));
                self.inbound.insert(
                    peer.clone(),
                    IncomingTransfer {
                        transfer,
                        chunks: Vec::new(),
                    },
                );
                Ok(())
            }
            ChannelMessage::FileAccepted { transfer_id } => {
                self.resolve_offer(peer, &transfer_id, OfferResponse::Accepted)
                    .await;
                Ok(())
            }
            ChannelMessage::FileDeclined { transfer_id } => {
                self.resolve_offer(peer, &transfer_id, OfferResponse::Declined)
                    .await;
                Ok(())
            }
            ChannelMessage::ChatMessage { .. } => Err(LinkError::ProtocolViolation(
                "chat message routed to transfer handling".into(),
            )),
        }
    }

    async fn resolve_offer(&self, peer: &PeerId, transfer_id: &str, answer: OfferResponse) {
        let waiter = {
            let mut out = self.outbound.lock().await;
            if out.slots.get(peer).map(String::as_str) == Some(transfer_id) {
                out.waiters.remove(transfer_id)
            } else {
                None
            }
        };
        match waiter {
            Some(tx) => {
                debug!(event = "offer_response", transfer_id, ?answer, "Offer answered");
                let _ = tx.send(answer);
            }
            None => {
                debug!(
                    event = "offer_response_ignored",
                    transfer_id,
                    peer = %peer.short(),
                    "No waiting offer for response"
                );
            }
        }
    }

    /// Accept or decline the inbound offer `transfer_id`.
    pub async fn respond(
        &mut self,
        transfer_id: &str,
        accept: bool,
        channel: &Arc<dyn DataChannel>,
    ) -> LinkResult<()> {
        let peer = self
            .incoming_peer(transfer_id)
            .ok_or_else(|| LinkError::UnknownTransfer(transfer_id.to_string()))?;
        let Some(entry) = self.inbound.get_mut(&peer) else {
            return Err(LinkError::UnknownTransfer(transfer_id.to_string()));
        };
        if entry.transfer.status != TransferStatus::Offered {
            return Err(LinkError::UnknownTransfer(transfer_id.to_string()));
        }

        let transfer_id = transfer_id.to_string();
        let msg = if accept {
            ChannelMessage::FileAccepted {
                transfer_id: transfer_id.clone(),
            }
        } else {
            ChannelMessage::FileDeclined {
                transfer_id: transfer_id.clone(),
            }
        };
        channel.send(msg.to_frame()?).await.map_err(|e| {
            warn!(event = "respond_send_failure", %transfer_id, %e, "Failed to answer offer");
            LinkError::ChannelUnavailable(peer.clone())
        })?;

        if !accept {
            if let Some(mut entry) = self.inbound.remove(&peer) {
                entry.transfer.status = TransferStatus::Declined;
                info!(event = "file_declined", %transfer_id, peer = %peer.short(), "Declined file");
                notify(&self.events, status_event(&entry.transfer));
            }
            return Ok(());
        }

        entry.transfer.status = TransferStatus::Accepted;
        info!(event = "file_accepted", %transfer_id, peer = %peer.short(), "Accepted file");
        notify(&self.events, status_event(&entry.transfer));

        if entry.transfer.total_chunks == 0 {
            if let Some(entry) = self.inbound.remove(&peer) {
                self.finish_incoming(entry)?;
            }
        }
        Ok(())
    }

    /// Append one binary frame to `peer`'s accepted inbound transfer.
    pub fn handle_chunk(&mut self, peer: &PeerId, data: Bytes) -> LinkResult<()> {
        let Some(entry) = self.inbound.get_mut(peer) else {
            return Err(LinkError::ProtocolViolation(format!(
                "chunk from {} without a transfer",
                peer.short()
            )));
        };
        match entry.transfer.status {
            TransferStatus::Accepted => {
                entry.transfer.status = TransferStatus::InProgress;
                notify(&self.events, status_event(&entry.transfer));
            }
            TransferStatus::InProgress => {}
            status => {
                return Err(LinkError::ProtocolViolation(format!(
                    "chunk for transfer {} in state {status:?}",
                    entry.transfer.transfer_id
                )));
            }
        }

        entry.chunks.push(data);
        entry.transfer.received_chunks += 1;
        notify(
            &self.events,
            TransferEvent::Progress {
                transfer_id: entry.transfer.transfer_id.clone(),
                peer: peer.clone(),
                direction: TransferDirection::Incoming,
                done: entry.transfer.received_chunks,
                total: entry.transfer.total_chunks,
            },
        );

        if entry.transfer.received_chunks < entry.transfer.total_chunks {
            return Ok(());
        }
        match self.inbound.remove(peer) {
            Some(entry) => self.finish_incoming(entry),
            None => Ok(()),
        }
    }

    fn finish_incoming(&self, entry: IncomingTransfer) -> LinkResult<()> {
        let IncomingTransfer {
            mut transfer,
            chunks,
        } = entry;
        let mut buf = BytesMut::with_capacity(transfer.size as usize);
        for chunk in &chunks {
            buf.extend_from_slice(chunk);
        }

        if buf.len() as u64 != transfer.size {
            transfer.status = TransferStatus::Failed;
            warn!(
                event = "file_size_mismatch",
                transfer_id = %transfer.transfer_id,
                expected = transfer.size,
                actual = buf.len(),
                "Reassembled size does not match metadata"
            );
            notify(&self.events, status_event(&transfer));
            return Err(LinkError::ProtocolViolation(format!(
                "transfer {}: received {} bytes, announced {}",
                transfer.transfer_id,
                buf.len(),
                transfer.size
            )));
        }

        transfer.status = TransferStatus::Completed;
        info!(
            event = "file_received",
            transfer_id = %transfer.transfer_id,
            peer = %transfer.peer.short(),
            name = %transfer.name,
            size = transfer.size,
            "File received"
        );
        notify(&self.events, status_event(&transfer));
        notify(
            &self.events,
            TransferEvent::Received {
                transfer,
                data: buf.freeze(),
            },
        );
        Ok(())
    }

    /// The session with `peer` is gone: fail its inbound transfer and cancel
    /// its outbound one. The sender task reports the outbound failure.
    pub async fn session_closed(&mut self, peer: &PeerId) {
        if let Some(mut entry) = self.inbound.remove(peer) {
            entry.transfer.status = TransferStatus::Failed;
            info!(
                event = "transfer_aborted",
                transfer_id = %entry.transfer.transfer_id,
                peer = %peer.short(),
                "Session closed during inbound transfer"
            );
            notify(&self.events, status_event(&entry.transfer));
        }

        let mut out = self.outbound.lock().await;
        if let Some(id) = out.slots.remove(peer) {
            out.waiters.remove(&id);
            info!(event = "transfer_aborted", transfer_id = %id, peer = %peer.short(), "Session closed during outbound transfer");
        }
    }
}

// ── Sender task ──────────────────────────────────────────────────────────────

struct OutboundTask {
    transfer: FileTransfer,
    data: Bytes,
    channel: Arc<dyn DataChannel>,
    response: oneshot::Receiver<OfferResponse>,
    outbound: Arc<Mutex<OutboundState>>,
    events: mpsc::UnboundedSender<TransferEvent>,
    settings: TransferSettings,
}

async fn drive_outbound(task: OutboundTask) {
    let OutboundTask {
        mut transfer,
        data,
        channel,
        mut response,
        outbound,
        events,
        settings,
    } = task;
    let id = transfer.transfer_id.clone();
    let peer = transfer.peer.clone();

    let answer = match timeout(settings.offer_timeout, &mut response).await {
        Ok(answer) => answer.ok(),
        Err(_) => {
            let expired = outbound.lock().await.waiters.remove(&id).is_some();
            if expired {
                let err = LinkError::TransferTimeout(id.clone());
                warn!(event = "offer_timeout", transfer_id = %id, peer = %peer.short(), %err, "Offer expired");
                release(&outbound, &peer, &id).await;
                transfer.status = TransferStatus::TimedOut;
                notify(&events, status_event(&transfer));
                return;
            }
            // A response took the waiter just before the deadline.
            response.await.ok()
        }
    };

    match answer {
        None => {
            fail_outbound(&outbound, &events, &mut transfer, "session closed").await;
            return;
        }
        Some(OfferResponse::Declined) => {
            release(&outbound, &peer, &id).await;
            transfer.status = TransferStatus::Declined;
            info!(event = "file_declined_by_peer", transfer_id = %id, peer = %peer.short(), "Peer declined file");
            notify(&events, status_event(&transfer));
            return;
        }
        Some(OfferResponse::Accepted) => {}
    }

    transfer.status = TransferStatus::Accepted;
    notify(&events, status_event(&transfer));
    transfer.status = TransferStatus::InProgress;
    notify(&events, status_event(&transfer));

    let chunk_size = transfer.chunk_size as usize;
    let mut offset = 0;
    while offset < data.len() {
        if !still_active(&outbound, &peer, &id).await {
            fail_outbound(&outbound, &events, &mut transfer, "session closed").await;
            return;
        }
        let end = (offset + chunk_size).min(data.len());
        if let Err(e) = channel.send(Frame::Binary(data.slice(offset..end))).await {
            warn!(event = "chunk_send_failure", transfer_id = %id, %e, "Chunk send failed");
            fail_outbound(&outbound, &events, &mut transfer, "channel send failed").await;
            return;
        }
        offset = end;
        transfer.received_chunks += 1;
        notify(
            &events,
            TransferEvent::Progress {
                transfer_id: id.clone(),
                peer: peer.clone(),
                direction: TransferDirection::Outgoing,
                done: transfer.received_chunks,
                total: transfer.total_chunks,
            },
        );
        if offset < data.len() && !settings.chunk_delay.is_zero() {
            sleep(settings.chunk_delay).await;
        }
    }

    release(&outbound, &peer, &id).await;
    transfer.status = TransferStatus::Completed;
    info!(
        event = "file_sent",
        transfer_id = %id,
        peer = %peer.short(),
        chunks = transfer.received_chunks,
        "File sent"
    );
    notify(&events, status_event(&transfer));
}

async fn fail_outbound(
    outbound: &Mutex<OutboundState>,
    events: &mpsc::UnboundedSender<TransferEvent>,
    transfer: &mut FileTransfer,
    reason: &str,
) {
    release(outbound, &transfer.peer, &transfer.transfer_id).await;
    transfer.status = TransferStatus::Failed;
    warn!(event = "file_send_failed", transfer_id = %transfer.transfer_id, reason, "Outbound transfer failed");
    notify(events, status_event(transfer));
}

async fn still_active(outbound: &Mutex<OutboundState>, peer: &PeerId, id: &str) -> bool {
    outbound.lock().await.slots.get(peer).map(String::as_str) == Some(id)
}

/// Free `peer`'s outbound slot if it still belongs to `id`, and drop the waiter.
async fn release(outbound: &Mutex<OutboundState>, peer: &PeerId, id: &str) {
    let mut out = outbound.lock().await;
    if out.slots.get(peer).map(String::as_str) == Some(id) {
        out.slots.remove(peer);
    }
    out.waiters.remove(id);
}

fn notify(events: &mpsc::UnboundedSender<TransferEvent>, event: TransferEvent) {
    if events.send(event).is_err() {
        debug!(event = "transfer_event_dropped", "No listener for transfer events");
    }
}

fn status_event(t: &FileTransfer) -> TransferEvent {
    TransferEvent::Status {
        transfer_id: t.transfer_id.clone(),
        peer: t.peer.clone(),
        direction: t.direction,
        status: t.status,
    }
}

/// `{sender}-{unix millis}-{random}`.
fn new_transfer_id(sender: &PeerId) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}-{}-{}", sender, now_millis(), suffix)
}

fn mime_type_for(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::mock::RecordingChannel;
    use crate::core::protocol::{decode, Inbound};

    fn settings() -> TransferSettings {
        TransferSettings {
            chunk_size: 16_384,
            offer_timeout: Duration::from_secs(30),
            chunk_delay: Duration::from_millis(10),
        }
    }

    fn controller(id: &str) -> (TransferController, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransferController::new(PeerId::from(id), settings(), tx), rx)
    }

    fn dyn_channel(ch: &Arc<RecordingChannel>) -> Arc<dyn DataChannel> {
        ch.clone()
    }

    async fn deliver(
        to: &mut TransferController,
        from: &PeerId,
        channel: &Arc<dyn DataChannel>,
        frames: Vec<Frame>,
    ) {
        for frame in frames {
            match decode(frame).unwrap() {
                Inbound::Control(msg) => to.handle_control(from, channel, msg).await.unwrap(),
                Inbound::Chunk(data) => to.handle_chunk(from, data).unwrap(),
            }
        }
    }

    async fn wait_status(rx: &mut mpsc::UnboundedReceiver<TransferEvent>, want: TransferStatus) {
        while let Some(ev) = rx.recv().await {
            if let TransferEvent::Status { status, .. } = ev {
                if status == want {
                    return;
                }
                assert!(!status.is_terminal(), "reached {status:?} instead of {want:?}");
            }
        }
        panic!("event stream ended before {want:?}");
    }

    async fn wait_received(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> (FileTransfer, Bytes) {
        while let Some(ev) = rx.recv().await {
            if let TransferEvent::Received { transfer, data } = ev {
                return (transfer, data);
            }
        }
        panic!("event stream ended before completion");
    }

    async fn incoming_offer(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> FileTransfer {
        match rx.recv().await {
            Some(TransferEvent::IncomingOffer(t)) => t,
            other => panic!("expected an offer, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn offer_times_out_exactly_once() {
        let (mut a, mut a_rx) = controller("a");
        let b = PeerId::from("b");
        let ch = RecordingChannel::new();
        let start = tokio::time::Instant::now();
        let offer = a
            .offer_file(&b, dyn_channel(&ch), "notes.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        wait_status(&mut a_rx, TransferStatus::TimedOut).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert!(!a.outbound_active(&b).await);

        // Late responses change nothing.
        for msg in [
            ChannelMessage::FileAccepted {
                transfer_id: offer.transfer_id.clone(),
            },
            ChannelMessage::FileDeclined {
                transfer_id: offer.transfer_id.clone(),
            },
        ] {
            a.handle_control(&b, &dyn_channel(&ch), msg).await.unwrap();
        }
        tokio::task::yield_now().await;
        assert!(a_rx.try_recv().is_err());
        assert_eq!(ch.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn forty_thousand_bytes_arrive_in_three_chunks() {
        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let (mut a, mut a_rx) = controller("a");
        let (mut b, mut b_rx) = controller("b");
        let (a_ch, b_ch) = (RecordingChannel::new(), RecordingChannel::new());

        let offer = a
            .offer_file(&b_id, dyn_channel(&a_ch), "data.bin", Bytes::from(payload.clone()))
            .await
            .unwrap();
        assert_eq!(offer.total_chunks, 3);
        assert_eq!(offer.mime_type, "application/octet-stream");

        deliver(&mut b, &a_id, &dyn_channel(&b_ch), a_ch.drain()).await;
        let incoming = incoming_offer(&mut b_rx).await;
        assert_eq!(incoming.transfer_id, offer.transfer_id);
        assert_eq!((incoming.size, incoming.chunk_size, incoming.total_chunks), (40_000, 16_384, 3));

        b.respond(&incoming.transfer_id, true, &dyn_channel(&b_ch))
            .await
            .unwrap();
        deliver(&mut a, &b_id, &dyn_channel(&a_ch), b_ch.drain()).await;
        wait_status(&mut a_rx, TransferStatus::Completed).await;

        let frames = a_ch.drain();
        let sizes: Vec<usize> = frames
            .iter()
            .map(|f| match f {
                Frame::Binary(d) => d.len(),
                Frame::Text(t) => panic!("unexpected text frame {t}"),
            })
            .collect();
        assert_eq!(sizes, vec![16_384, 16_384, 7_232]);

        let mut frames = frames.into_iter();
        deliver(&mut b, &a_id, &dyn_channel(&b_ch), frames.by_ref().take(2).collect()).await;
        let partial = b.inbound_of(&a_id).unwrap();
        assert_eq!(partial.status, TransferStatus::InProgress);
        assert_eq!(partial.received_chunks, 2);

        deliver(&mut b, &a_id, &dyn_channel(&b_ch), frames.collect()).await;
        let (done, data) = wait_received(&mut b_rx).await;
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(done.received_chunks, 3);
        assert_eq!(&data[..], &payload[..]);
        assert!(b.inbound_of(&a_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reassembly_is_exact_around_chunk_boundaries() {
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        for chunk_size in [16_384usize, 1_000] {
            let sizes = [
                1,
                chunk_size - 1,
                chunk_size,
                chunk_size + 1,
                2 * chunk_size,
                40_000,
            ];
            for size in sizes {
                let payload: Vec<u8> = (0..size).map(|i| (i * 31 % 253) as u8).collect();
                let (tx, mut a_rx) = mpsc::unbounded_channel();
                let mut a = TransferController::new(
                    a_id.clone(),
                    TransferSettings {
                        chunk_size,
                        ..settings()
                    },
                    tx,
                );
                // The receiver's own chunk size must not matter.
                let (mut b, mut b_rx) = controller("b");
                let (a_ch, b_ch) = (RecordingChannel::new(), RecordingChannel::new());

                let offer = a
                    .offer_file(&b_id, dyn_channel(&a_ch), "blob", Bytes::from(payload.clone()))
                    .await
                    .unwrap();
                let expected_chunks = size.div_ceil(chunk_size);
                assert_eq!(offer.total_chunks, expected_chunks as u64, "size {size}");

                deliver(&mut b, &a_id, &dyn_channel(&b_ch), a_ch.drain()).await;
                let incoming = incoming_offer(&mut b_rx).await;
                assert_eq!(incoming.chunk_size, chunk_size as u64);
                assert_eq!(incoming.total_chunks, expected_chunks as u64);
                b.respond(&incoming.transfer_id, true, &dyn_channel(&b_ch))
                    .await
                    .unwrap();
                deliver(&mut a, &b_id, &dyn_channel(&a_ch), b_ch.drain()).await;
                wait_status(&mut a_rx, TransferStatus::Completed).await;

                let frames = a_ch.drain();
                let got: Vec<usize> = frames
                    .iter()
                    .map(|f| match f {
                        Frame::Binary(d) => d.len(),
                        Frame::Text(t) => panic!("unexpected text frame {t}"),
                    })
                    .collect();
                let want: Vec<usize> = (0..expected_chunks)
                    .map(|i| chunk_size.min(size - i * chunk_size))
                    .collect();
                assert_eq!(got, want, "chunk {chunk_size}, size {size}");

                deliver(&mut b, &a_id, &dyn_channel(&b_ch), frames).await;
                let (done, data) = wait_received(&mut b_rx).await;
                assert_eq!(done.received_chunks, expected_chunks as u64);
                assert_eq!(&data[..], &payload[..], "chunk {chunk_size}, size {size}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn decline_resolves_once_and_only_from_the_offered_peer() {
        let (mut a, mut a_rx) = controller("a");
        let (b, c) = (PeerId::from("b"), PeerId::from("c"));
        let ch = RecordingChannel::new();
        let offer = a
            .offer_file(&b, dyn_channel(&ch), "x.txt", Bytes::from_static(b"x"))
            .await
            .unwrap();
        let declined = ChannelMessage::FileDeclined {
            transfer_id: offer.transfer_id.clone(),
        };

        a.handle_control(&c, &dyn_channel(&ch), declined.clone()).await.unwrap();
        assert!(a.outbound_active(&b).await);

        a.handle_control(&b, &dyn_channel(&ch), declined.clone()).await.unwrap();
        wait_status(&mut a_rx, TransferStatus::Declined).await;
        a.handle_control(&b, &dyn_channel(&ch), declined).await.unwrap();

        // Nothing more, not even the timeout.
        sleep(Duration::from_secs(60)).await;
        assert!(a_rx.try_recv().is_err());
        assert!(!a.outbound_active(&b).await);
    }

    #[tokio::test]
    async fn second_outbound_offer_is_busy() {
        let (mut a, _rx) = controller("a");
        let ch = RecordingChannel::new();
        let (b, c) = (PeerId::from("b"), PeerId::from("c"));
        a.offer_file(&b, dyn_channel(&ch), "1", Bytes::from_static(b"1"))
            .await
            .unwrap();
        let err = a
            .offer_file(&b, dyn_channel(&ch), "2", Bytes::from_static(b"2"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::TransferBusy(p) if p == b));
        a.offer_file(&c, dyn_channel(&ch), "3", Bytes::from_static(b"3"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn second_inbound_offer_is_declined_automatically() {
        let (mut b, mut b_rx) = controller("b");
        let a = PeerId::from("a");
        let ch = RecordingChannel::new();
        for id in ["t1", "t2"] {
            let meta = ChannelMessage::FileMetadata {
                transfer_id: id.into(),
                name: "f".into(),
                size: 10,
                mime_type: "text/plain".into(),
                chunk_size: 4,
            };
            b.handle_control(&a, &dyn_channel(&ch), meta).await.unwrap();
        }

        assert_eq!(incoming_offer(&mut b_rx).await.transfer_id, "t1");
        assert!(b_rx.try_recv().is_err());
        assert_eq!(b.inbound_of(&a).unwrap().transfer_id, "t1");
        let sent = ch.drain();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            decode(sent[0].clone()).unwrap(),
            Inbound::Control(ChannelMessage::FileDeclined { transfer_id }) if transfer_id == "t2"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_file_completes_on_acceptance() {
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let (mut a, mut a_rx) = controller("a");
        let (mut b, mut b_rx) = controller("b");
        let (a_ch, b_ch) = (RecordingChannel::new(), RecordingChannel::new());

        a.offer_file(&b_id, dyn_channel(&a_ch), "empty", Bytes::new())
            .await
            .unwrap();
        deliver(&mut b, &a_id, &dyn_channel(&b_ch), a_ch.drain()).await;
        let incoming = incoming_offer(&mut b_rx).await;
        assert_eq!(incoming.total_chunks, 0);

        b.respond(&incoming.transfer_id, true, &dyn_channel(&b_ch))
            .await
            .unwrap();
        let (done, data) = wait_received(&mut b_rx).await;
        assert_eq!(done.status, TransferStatus::Completed);
        assert!(data.is_empty());

        deliver(&mut a, &b_id, &dyn_channel(&a_ch), b_ch.drain()).await;
        wait_status(&mut a_rx, TransferStatus::Completed).await;
        assert!(a_ch.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_close_fails_both_directions() {
        let (a_id, b_id) = (PeerId::from("a"), PeerId::from("b"));
        let (mut a, mut a_rx) = controller("a");
        let (mut b, mut b_rx) = controller("b");
        let (a_ch, b_ch) = (RecordingChannel::new(), RecordingChannel::new());

        a.offer_file(&b_id, dyn_channel(&a_ch), "f", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        deliver(&mut b, &a_id, &dyn_channel(&b_ch), a_ch.drain()).await;
        incoming_offer(&mut b_rx).await;

        a.session_closed(&b_id).await;
        wait_status(&mut a_rx, TransferStatus::Failed).await;
        assert!(!a.outbound_active(&b_id).await);

        b.session_closed(&a_id).await;
        wait_status(&mut b_rx, TransferStatus::Failed).await;
        assert!(b.inbound_of(&a_id).is_none());
    }

    #[tokio::test]
    async fn respond_and_chunks_need_a_matching_offer() {
        let (mut b, _rx) = controller("b");
        let ch = RecordingChannel::new();
        assert!(matches!(
            b.respond("nope", true, &dyn_channel(&ch)).await,
            Err(LinkError::UnknownTransfer(_))
        ));
        assert!(matches!(
            b.handle_chunk(&PeerId::from("a"), Bytes::from_static(b"zz")),
            Err(LinkError::ProtocolViolation(_))
        ));
        let meta = ChannelMessage::FileMetadata {
            transfer_id: "t".into(),
            name: "f".into(),
            size: 1,
            mime_type: "text/plain".into(),
            chunk_size: 0,
        };
        assert!(matches!(
            b.handle_control(&PeerId::from("a"), &dyn_channel(&ch), meta).await,
            Err(LinkError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn transfer_ids_name_the_sender() {
        let id = new_transfer_id(&PeerId::from("alice"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "alice");
        assert!(parts[1].parse::<u64>().is_ok());
        assert_eq!(parts[2].len(), 6);
        assert_eq!(mime_type_for("a.PNG"), "image/png");
    }
}
