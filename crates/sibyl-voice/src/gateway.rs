//! Voice gateway boundary.
//!
//! The concrete transport (gateway handshake, UDP framing, encryption)
//! lives outside this crate; the session controller only sees these traits.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sibyl_audio::frame::AudioFrame;

/// Events delivered by the transport while connected.
#[derive(Debug)]
pub enum GatewayEvent {
    /// A compressed audio frame from some speaker stream.
    Frame(AudioFrame),
    /// Signaling: binds a frame source identifier to a stable user identity.
    /// Frames may race ahead of this event; until it lands they are dropped.
    Speaking { ssrc: u32, user_id: String },
}

/// An established voice connection.
pub struct VoiceLink {
    pub guild_id: String,
    pub channel_id: String,
    /// Inbound frames and signaling events.
    pub events: mpsc::Receiver<GatewayEvent>,
    /// Outbound queue of encoded frames.
    pub opus_tx: mpsc::Sender<Vec<u8>>,
    /// Control surface for the live connection.
    pub control: Arc<dyn LinkControl>,
}

#[async_trait]
pub trait LinkControl: Send + Sync {
    /// Toggle the speaking indicator bracketing outbound audio.
    async fn set_speaking(&self, speaking: bool) -> anyhow::Result<()>;
    /// Move the live connection to another channel in the same guild.
    async fn switch_channel(&self, channel_id: &str) -> anyhow::Result<()>;
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Join a guild voice channel and return the live link.
    async fn join(&self, guild_id: &str, channel_id: &str) -> anyhow::Result<VoiceLink>;
}
