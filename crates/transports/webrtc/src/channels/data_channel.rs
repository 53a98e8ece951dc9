//! WebRTC data channel backing the peer reliable channel

use super::{ReliableChannel, MAX_MESSAGE_SIZE};
use crate::config::DataChannelMode;
use crate::peer::{LinkEventSink, TransportEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

/// Channel statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChannelStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Messages sent count
    pub messages_sent: u64,
    /// Messages received count
    pub messages_received: u64,
}

/// Reliable channel over an `RTCDataChannel`
///
/// Open, close and message callbacks are forwarded to the owning link as
/// [`TransportEvent`]s.
pub struct RtcReliableChannel {
    label: String,
    rtc_channel: Arc<RTCDataChannel>,
    mode: DataChannelMode,
    open: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

impl RtcReliableChannel {
    /// Create a channel on a local peer connection
    pub async fn create(
        peer_connection: &RTCPeerConnection,
        label: &str,
        mode: DataChannelMode,
        events: LinkEventSink,
    ) -> Result<Arc<Self>> {
        let init = RTCDataChannelInit {
            ordered: Some(mode.ordered()),
            max_retransmits: mode.max_retransmits(),
            ..Default::default()
        };

        let rtc_channel = peer_connection
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| {
                Error::DataChannelError(format!("Failed to create data channel: {}", e))
            })?;

        Ok(Self::attach(rtc_channel, mode, events))
    }

    /// Wrap a channel announced by the remote peer
    pub fn attach(
        rtc_channel: Arc<RTCDataChannel>,
        mode: DataChannelMode,
        events: LinkEventSink,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            label: rtc_channel.label().to_string(),
            rtc_channel,
            mode,
            open: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
        });

        channel.install_handlers(events);
        channel
    }

    /// Handlers hold weak references only, so the caller owns the wrapper
    /// until the open event hands a strong one to the link.
    fn install_handlers(self: &Arc<Self>, events: LinkEventSink) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let sink = events.clone();
        self.rtc_channel.on_open(Box::new(move || {
            let weak = weak.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let Some(channel) = weak.upgrade() else {
                    debug!(peer_id = %sink.peer_id(), "Data channel opened after release");
                    return;
                };
                debug!(peer_id = %sink.peer_id(), "Data channel '{}' opened", channel.label);
                channel.open.store(true, Ordering::SeqCst);
                sink.emit(TransportEvent::ChannelOpened(
                    channel as Arc<dyn ReliableChannel>,
                ));
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let sink = events.clone();
        self.rtc_channel.on_close(Box::new(move || {
            let weak = weak.clone();
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    debug!(peer_id = %sink.peer_id(), "Data channel '{}' closed", channel.label);
                    channel.open.store(false, Ordering::SeqCst);
                }
                sink.emit(TransportEvent::ChannelClosed);
            })
        }));

        let label = self.label.clone();
        self.rtc_channel.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                error!("Data channel '{}' error: {}", label, err);
            })
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let sink = events;
        self.rtc_channel.on_message(Box::new(move |msg| {
            let data = msg.data.to_vec();
            let weak = weak.clone();
            let sink = sink.clone();
            Box::pin(async move {
                if let Some(channel) = weak.upgrade() {
                    channel
                        .bytes_received
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    channel.messages_received.fetch_add(1, Ordering::Relaxed);
                }

                match String::from_utf8(data) {
                    Ok(text) => {
                        sink.emit(TransportEvent::ChannelMessage(text));
                    }
                    Err(e) => warn!(
                        peer_id = %sink.peer_id(),
                        "Dropping non-UTF-8 data channel frame: {}", e
                    ),
                }
            })
        }));
    }

    pub fn mode(&self) -> DataChannelMode {
        self.mode
    }

    pub fn stats(&self) -> DataChannelStats {
        DataChannelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl ReliableChannel for RtcReliableChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(Error::DataChannelError(format!(
                "Message size {} exceeds maximum {} bytes",
                text.len(),
                MAX_MESSAGE_SIZE
            )));
        }

        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "Data channel '{}' is not open",
                self.label
            )));
        }

        self.rtc_channel
            .send_text(text.to_string())
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to send message: {}", e)))?;

        self.bytes_sent
            .fetch_add(text.len() as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.rtc_channel
            .close()
            .await
            .map_err(|e| Error::DataChannelError(format!("Failed to close channel: {}", e)))?;

        debug!("Data channel '{}' closed", self.label);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use webrtc::api::APIBuilder;
    use webrtc::peer_connection::configuration::RTCConfiguration;

    #[tokio::test]
    async fn test_unopened_channel_is_freed_when_released() {
        let api = APIBuilder::new().build();
        let peer_connection = api
            .new_peer_connection(RTCConfiguration::default())
            .await
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let events = LinkEventSink::new("peer-b", 1, tx);

        let channel = RtcReliableChannel::create(
            &peer_connection,
            "mesh",
            DataChannelMode::Reliable,
            events,
        )
        .await
        .unwrap();
        assert!(!channel.is_open());
        assert_eq!(channel.label(), "mesh");

        let released = Arc::downgrade(&channel);
        drop(channel);
        assert!(released.upgrade().is_none());

        peer_connection.close().await.unwrap();
    }
}
