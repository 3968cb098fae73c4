//! Data channel wrapper and handler attachment.

use crate::core::connection::{DataChannel, EngineEvent, EngineEventSink, Frame};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl WebRtcChannel {
    /// Attach `on_open`, `on_close`, `on_error` and `on_message` to `dc`,
    /// forwarding everything into `sink`.
    pub(super) fn attach(dc: Arc<RTCDataChannel>, sink: &EngineEventSink) -> Arc<dyn DataChannel> {
        let label = dc.label().to_string();

        let tx = sink.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                tx.emit(EngineEvent::ChannelOpen);
            })
        }));

        let tx = sink.clone();
        let l = label.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            let l = l.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %l, "DataChannel closed by transport");
                tx.emit(EngineEvent::ChannelClosed);
            })
        }));

        let tx = sink.clone();
        let l = label.clone();
        dc.on_error(Box::new(move |err| {
            let tx = tx.clone();
            let l = l.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %l, %err, "DataChannel transport error");
                tx.emit(EngineEvent::ChannelError(err.to_string()));
            })
        }));

        let tx = sink.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    Frame::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    Frame::Binary(msg.data)
                };
                tx.emit(EngineEvent::ChannelMessage(frame));
            })
        }));

        Arc::new(Self { dc, label })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Text(text) => self.dc.send_text(text).await?,
            Frame::Binary(data) => self.dc.send(&data).await?,
        };
        Ok(())
    }
}
