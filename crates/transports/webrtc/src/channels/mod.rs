//! Peer reliable channel
//!
//! Each peer link carries one ordered data channel (label [`CHANNEL_LABEL`])
//! used for low-latency `player_state` and `screen_track_metadata`
//! envelopes. Delivery mode is set by [`crate::config::DataChannelMode`].

mod data_channel;

pub use data_channel::{DataChannelStats, RtcReliableChannel};

use crate::Result;
use async_trait::async_trait;

/// Label of the mesh data channel
pub const CHANNEL_LABEL: &str = "mesh";

/// Maximum size of a single text frame
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Ordered text channel to one peer
#[async_trait]
pub trait ReliableChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
