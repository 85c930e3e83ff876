//! Voice session controller.
//!
//! One live guild connection per session. All connection state (the
//! speaker mapping, the mixer, the in-flight tasks) lives on the session
//! so concurrent sessions cannot cross-contaminate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use sibyl_audio::codec::OpusEncoder;
use sibyl_audio::ffmpeg;
use sibyl_audio::mixer::Mixer;
use sibyl_audio::segmenter::Segmenter;
use sibyl_core::config::Config;
use sibyl_providers::{ChatBrain, ChatMessage, TextToSpeech, Transcriber};

use crate::gateway::{GatewayEvent, LinkControl, VoiceLink, VoiceTransport};
use crate::storage::ObjectStore;

/// Merged-output queue depth between the mixer and the outbound encoder.
const MIX_OUT_DEPTH: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("connected in a different guild")]
    WrongGuild,

    #[error("not in a voice channel")]
    NotConnected,

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("audio error: {0}")]
    Audio(String),
}

/// Session tuning, resolved from [`Config`] or built directly in tests.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub utterance_timeout: Duration,
    pub min_utterance: Duration,
    pub upload_min: Duration,
    pub wake_word: Option<String>,
    pub use_mixer: bool,
    pub playback_volume: f64,
    pub capture_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            utterance_timeout: Duration::from_millis(config.voice.utterance_timeout_ms),
            min_utterance: Duration::from_millis(config.voice.min_utterance_ms),
            upload_min: Duration::from_millis(config.voice.upload_min_ms),
            wake_word: config.voice.wake_word.clone(),
            use_mixer: config.voice.mixer,
            playback_volume: config.voice.playback_volume,
            capture_dir: config.capture_dir(),
            cache_dir: config.cache_dir(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Collaborators injected into a session.
pub struct SessionDeps {
    pub transport: Arc<dyn VoiceTransport>,
    pub transcriber: Arc<dyn Transcriber>,
    pub brain: Arc<dyn ChatBrain>,
    pub tts: Arc<dyn TextToSpeech>,
    pub store: Option<Arc<dyn ObjectStore>>,
}

/// Everything owned by a live connection, torn down as a unit on leave.
pub(crate) struct Connected {
    pub(crate) guild_id: String,
    pub(crate) channel_id: String,
    pub(crate) control: Arc<dyn LinkControl>,
    pub(crate) speakers: Arc<RwLock<HashMap<u32, String>>>,
    pub(crate) opus_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) mixer: Option<Arc<Mixer>>,
    encoder: Option<JoinHandle<()>>,
    segmenter: Arc<Segmenter>,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
    consumer: JoinHandle<()>,
}

pub struct VoiceSession {
    pub(crate) config: SessionConfig,
    pub(crate) deps: SessionDeps,
    pub(crate) active: Mutex<Option<Connected>>,
    /// Serializes join/leave; never held across frame delivery.
    lifecycle: tokio::sync::Mutex<()>,
    /// The sole serialization point for turns. `try_lock` failure means a
    /// turn is in flight and the new utterance is shed.
    pub(crate) turn_lock: tokio::sync::Mutex<()>,
    pub(crate) history: Mutex<Vec<ChatMessage>>,
    /// Self-handle for the tasks and chat functions a session spawns.
    pub(crate) weak: Weak<VoiceSession>,
}

impl VoiceSession {
    pub fn new(config: SessionConfig, deps: SessionDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            deps,
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            turn_lock: tokio::sync::Mutex::new(()),
            history: Mutex::new(Vec::new()),
            weak: weak.clone(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    pub fn connected_guild(&self) -> Option<String> {
        self.active.lock().unwrap().as_ref().map(|c| c.guild_id.clone())
    }

    pub fn current_channel(&self) -> Option<String> {
        self.active.lock().unwrap().as_ref().map(|c| c.channel_id.clone())
    }

    /// Join a voice channel. A join for a different guild while connected is
    /// rejected; a different channel in the same guild switches in place.
    pub async fn join(&self, guild_id: &str, channel_id: &str) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;

        let switch_control = {
            let active = self.active.lock().unwrap();
            match active.as_ref() {
                Some(conn) if conn.guild_id != guild_id => return Err(SessionError::WrongGuild),
                Some(conn) if conn.channel_id != channel_id => Some(Arc::clone(&conn.control)),
                Some(_) => return Ok(()), // already there
                None => None,
            }
        };

        if let Some(control) = switch_control {
            control
                .switch_channel(channel_id)
                .await
                .map_err(|e| SessionError::Gateway(e.to_string()))?;
            if let Some(conn) = self.active.lock().unwrap().as_mut() {
                conn.channel_id = channel_id.to_string();
            }
            info!(guild = guild_id, channel = channel_id, "switched voice channel");
            return Ok(());
        }

        let link = self
            .deps
            .transport
            .join(guild_id, channel_id)
            .await
            .map_err(|e| SessionError::Gateway(e.to_string()))?;

        let conn = self.wire(link);
        *self.active.lock().unwrap() = Some(conn);
        info!(guild = guild_id, channel = channel_id, "joined voice channel");
        Ok(())
    }

    /// Wire up a fresh connection: segmenter, listener, utterance consumer,
    /// and (when enabled) the mixer with its outbound encoder.
    fn wire(&self, link: VoiceLink) -> Connected {
        let VoiceLink {
            guild_id,
            channel_id,
            events,
            opus_tx,
            control,
        } = link;

        let cancel = CancellationToken::new();
        let speakers: Arc<RwLock<HashMap<u32, String>>> = Arc::new(RwLock::new(HashMap::new()));

        let (segmenter, utterances) = Segmenter::start(self.config.utterance_timeout);
        let segmenter = Arc::new(segmenter);

        let (mixer, encoder) = if self.config.use_mixer {
            let (pcm_tx, pcm_rx) = mpsc::channel(MIX_OUT_DEPTH);
            let mixer = Arc::new(Mixer::new(pcm_tx));
            mixer.start();

            let out = opus_tx.clone();
            let encoder = tokio::spawn(async move {
                let encoder = match OpusEncoder::new() {
                    Ok(encoder) => encoder,
                    Err(e) => {
                        error!(%e, "failed to construct outbound encoder");
                        return;
                    }
                };
                match ffmpeg::stream_pcm_to_opus(encoder, pcm_rx, out).await {
                    Ok(()) => debug!("outbound encoder drained"),
                    Err(e) => debug!(%e, "outbound encoder stopped"),
                }
            });
            (Some(mixer), Some(encoder))
        } else {
            (None, None)
        };

        let listener = tokio::spawn(listen(
            events,
            Arc::clone(&speakers),
            Arc::clone(&segmenter),
            cancel.clone(),
        ));

        // The consumer spawns a detached task per utterance; overlap is
        // shed inside the turn by the try-lock, never queued here.
        let consumer = tokio::spawn({
            let session = self.weak.clone();
            let cancel = cancel.clone();
            let mut utterances = utterances;
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        utterance = utterances.recv() => {
                            let Some(utterance) = utterance else { break };
                            let Some(session) = session.upgrade() else { break };
                            tokio::spawn(async move {
                                session.handle_utterance(utterance).await;
                            });
                        }
                    }
                }
            }
        });

        Connected {
            guild_id,
            channel_id,
            control,
            speakers,
            opus_tx,
            mixer,
            encoder,
            segmenter,
            cancel,
            listener,
            consumer,
        }
    }

    /// Leave the current voice channel, tearing down every task wired by
    /// [`VoiceSession::join`]. Idempotent: a second leave reports
    /// [`SessionError::NotConnected`]. Safe to call while a turn is in
    /// flight; in-flight audio streams observe their closed queues and
    /// abort instead of deadlocking.
    pub async fn leave(&self) -> Result<(), SessionError> {
        let _lifecycle = self.lifecycle.lock().await;

        let Some(conn) = self.active.lock().unwrap().take() else {
            return Err(SessionError::NotConnected);
        };
        let Connected {
            control,
            mixer,
            encoder,
            segmenter,
            cancel,
            listener,
            consumer,
            ..
        } = conn;

        cancel.cancel();
        let _ = listener.await;
        let _ = consumer.await;
        segmenter.stop().await;
        if let Some(mixer) = mixer {
            mixer.stop().await;
        }
        if let Some(encoder) = encoder {
            let _ = encoder.await;
        }

        let _ = control.set_speaking(false).await;
        control
            .disconnect()
            .await
            .map_err(|e| SessionError::Gateway(e.to_string()))?;
        info!("left voice channel");
        Ok(())
    }

    /// Mix a compressed audio stream (e.g. background playback) into the
    /// outbound channel alongside speech.
    pub async fn play<R>(&self, reader: R) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let source = {
            let active = self.active.lock().unwrap();
            let Some(conn) = active.as_ref() else {
                return Err(SessionError::NotConnected);
            };
            let Some(mixer) = conn.mixer.as_ref() else {
                return Err(SessionError::Audio("mixer disabled for this session".into()));
            };
            mixer.create()
        };

        ffmpeg::stream_mp3_to_pcm(reader, self.config.playback_volume, source)
            .await
            .map_err(|e| SessionError::Audio(e.to_string()))
    }
}

/// Inbound listener: keeps the speaker mapping synced from signaling events
/// and demultiplexes frames to the segmenter by speaker.
async fn listen(
    mut events: mpsc::Receiver<GatewayEvent>,
    speakers: Arc<RwLock<HashMap<u32, String>>>,
    segmenter: Arc<Segmenter>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => {
                match event {
                    Some(GatewayEvent::Speaking { ssrc, user_id }) => {
                        debug!(ssrc, user = %user_id, "speaker mapping updated");
                        speakers.write().unwrap().insert(ssrc, user_id);
                    }
                    Some(GatewayEvent::Frame(frame)) => {
                        let speaker = speakers.read().unwrap().get(&frame.ssrc).cloned();
                        match speaker {
                            Some(user) => segmenter.push(&user, frame),
                            // mapping hasn't arrived yet: drop, don't queue
                            None => debug!(ssrc = frame.ssrc, "dropping frame from unmapped source"),
                        }
                    }
                    None => break,
                }
            }
        }
    }
    info!("no longer listening");
}
