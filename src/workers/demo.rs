//! Loopback run: two nodes on an in-process relay, linked over real WebRTC.
//!
//! The sending node connects, sends a chat line and optionally offers a file;
//! the receiving node accepts every offer and writes the file to `out_dir`.

use crate::core::config::NodeConfig;
use crate::core::connection::webrtc::WebRtcEngineFactory;
use crate::core::connection::EngineFactory;
use crate::core::node::{Node, NodeEvent};
use crate::core::peer::PeerId;
use crate::core::signaling::MemoryRelay;
use crate::core::transfer::{TransferDirection, TransferEvent};
use crate::utils::sos::SignalOfStop;
use crate::workers::args::Args;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

/// Upper bound on each phase (discovery, link, chat, transfer).
const PHASE_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_MESSAGE: &str = "hello from peerlink";

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    let relay = MemoryRelay::new();
    let engines: Arc<dyn EngineFactory> = Arc::new(WebRtcEngineFactory::new(args.ice_servers.clone())?);

    let sender_cfg = args.node_config();
    let receiver_cfg = NodeConfig {
        display_name: format!("{}-receiver", sender_cfg.display_name),
        ..sender_cfg.clone()
    };

    let (sender, mut sender_rx) = Node::start(
        PeerId::generate(),
        sender_cfg,
        Arc::new(relay.client()),
        engines.clone(),
    )
    .await?;
    let (receiver, mut receiver_rx) = Node::start(
        PeerId::generate(),
        receiver_cfg,
        Arc::new(relay.client()),
        engines,
    )
    .await?;

    let result = exchange(&args, &sos, &sender, &mut sender_rx, &receiver, &mut receiver_rx).await;

    sender.teardown().await;
    receiver.teardown().await;
    result
}

async fn exchange(
    args: &Args,
    sos: &SignalOfStop,
    sender: &Node,
    sender_rx: &mut UnboundedReceiver<NodeEvent>,
    receiver: &Node,
    receiver_rx: &mut UnboundedReceiver<NodeEvent>,
) -> Result<()> {
    let (tx, rx) = (sender.handle(), receiver.handle());
    let (tx_id, rx_id) = (tx.local_id().clone(), rx.local_id().clone());

    wait_for(sos, sender_rx, "discovery", |e| {
        matches!(e, NodeEvent::PeersChanged(p) if p.iter().any(|r| r.peer_id == rx_id))
    })
    .await?;

    // Both sides ask; the tie-break lets exactly one of them offer.
    let (a, b) = tokio::join!(tx.connect(&rx_id), rx.connect(&tx_id));
    let (a, b) = (a?, b?);
    info!(event = "connect_requested", sender = ?a, receiver = ?b, "Connect requested");

    wait_for(sos, sender_rx, "link", |e| matches!(e, NodeEvent::Connected(p) if *p == rx_id)).await?;
    wait_for(sos, receiver_rx, "link", |e| matches!(e, NodeEvent::Connected(p) if *p == tx_id)).await?;
    println!("linked {} <-> {}", tx_id.short(), rx_id.short());

    let text = args.message.clone().unwrap_or_else(|| DEFAULT_MESSAGE.to_string());
    tx.send_chat(&rx_id, text).await?;
    if let NodeEvent::Chat { from, text, .. } =
        wait_for(sos, receiver_rx, "chat", |e| matches!(e, NodeEvent::Chat { .. })).await?
    {
        println!("[{}] {}", from.short(), text);
    }

    let Some(path) = &args.send else {
        return Ok(());
    };
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;

    let offer = tx.offer_file(&rx_id, name, Bytes::from(data)).await?;
    info!(event = "file_offered", transfer_id = %offer.transfer_id, size = offer.size, mime = %offer.mime_type, "File offered");

    let out_dir = args.out_dir.clone().unwrap_or_else(|| PathBuf::from("."));
    loop {
        match wait_for(sos, receiver_rx, "transfer", |e| matches!(e, NodeEvent::Transfer(_))).await? {
            NodeEvent::Transfer(TransferEvent::IncomingOffer(t)) => {
                println!("incoming {} ({} bytes, {})", t.name, t.size, t.mime_type);
                rx.respond_to_offer(&t.transfer_id, true).await?;
            }
            NodeEvent::Transfer(TransferEvent::Progress { done, total, .. }) => {
                info!(event = "transfer_progress", done, total, "Receiving");
            }
            NodeEvent::Transfer(TransferEvent::Received { transfer, data }) => {
                let dest = out_dir.join(safe_file_name(&transfer.name));
                tokio::fs::create_dir_all(&out_dir).await?;
                tokio::fs::write(&dest, &data)
                    .await
                    .with_context(|| format!("writing {}", dest.display()))?;
                println!("saved {} ({} bytes)", dest.display(), data.len());
                break;
            }
            NodeEvent::Transfer(TransferEvent::Status {
                transfer_id,
                status,
                direction: TransferDirection::Incoming,
                ..
            }) if status.is_terminal() => {
                bail!("transfer {transfer_id} ended as {status:?}");
            }
            _ => {}
        }
    }

    match wait_for(sos, sender_rx, "transfer", |e| {
        matches!(
            e,
            NodeEvent::Transfer(TransferEvent::Status { direction: TransferDirection::Outgoing, status, .. })
                if status.is_terminal()
        )
    })
    .await?
    {
        NodeEvent::Transfer(TransferEvent::Status { status, .. }) => {
            info!(event = "transfer_finished", ?status, "Outgoing transfer finished");
        }
        other => warn!(event = "unexpected_event", ?other, "Unexpected node event"),
    }
    Ok(())
}

/// Next event matching `pred`, bounded by [`PHASE_TIMEOUT`] and by `sos`.
async fn wait_for(
    sos: &SignalOfStop,
    rx: &mut UnboundedReceiver<NodeEvent>,
    phase: &str,
    mut pred: impl FnMut(&NodeEvent) -> bool,
) -> Result<NodeEvent> {
    let next = async {
        while let Some(ev) = rx.recv().await {
            if pred(&ev) {
                return Some(ev);
            }
        }
        None
    };
    tokio::select! {
        _ = sos.wait() => bail!("interrupted during {phase}"),
        res = tokio::time::timeout(PHASE_TIMEOUT, next) => match res {
            Ok(Some(ev)) => Ok(ev),
            Ok(None) => bail!("node stopped during {phase}"),
            Err(_) => bail!("{phase} timed out after {}s", PHASE_TIMEOUT.as_secs()),
        },
    }
}

/// Last path component of a peer-supplied name, so writes stay inside `out_dir`.
fn safe_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .filter(|n| !n.is_empty() && n != "..")
        .unwrap_or_else(|| "received.bin".to_string())
}
