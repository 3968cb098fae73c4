//! Data-channel protocol.
//!
//! Text frames carry one JSON [`ChannelMessage`], tagged by `type`. Binary
//! frames are raw file chunks with no header; the receiver attributes them to
//! the single inbound transfer in progress on that channel.

use crate::core::connection::Frame;
use crate::core::error::{LinkError, LinkResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelMessage {
    /// Offer of a file; chunks follow only after `FileAccepted`.
    #[serde(rename_all = "camelCase")]
    FileMetadata {
        transfer_id: String,
        name: String,
        size: u64,
        mime_type: String,
        chunk_size: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileAccepted { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    FileDeclined { transfer_id: String },
    #[serde(rename_all = "camelCase")]
    ChatMessage { text: String, sent_at: u64 },
}

impl ChannelMessage {
    pub fn to_frame(&self) -> LinkResult<Frame> {
        let json = serde_json::to_string(self)
            .map_err(|e| LinkError::ProtocolViolation(format!("encode: {e}")))?;
        Ok(Frame::Text(json))
    }
}

/// A frame received on the data channel, classified.
#[derive(Debug)]
pub enum Inbound {
    Control(ChannelMessage),
    Chunk(Bytes),
}

pub fn decode(frame: Frame) -> LinkResult<Inbound> {
    match frame {
        Frame::Text(text) => serde_json::from_str(&text)
            .map(Inbound::Control)
            .map_err(|e| LinkError::ProtocolViolation(format!("bad control message: {e}"))),
        Frame::Binary(data) => Ok(Inbound::Chunk(data)),
    }
}

/// Number of chunks a file of `size` bytes is split into.
pub fn total_chunks(size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size)
}
