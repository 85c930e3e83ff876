//! End-to-end session tests over a fake transport and fake providers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use sibyl_audio::codec::OpusEncoder;
use sibyl_audio::frame::{AudioFrame, FRAME_LEN, FRAME_SAMPLES};
use sibyl_core::pipe::LinePipe;
use sibyl_providers::{
    ChatBrain, ChatMessage, SpeechStream, TextToSpeech, Transcriber, TurnRequest, Voice,
};
use sibyl_voice::gateway::{GatewayEvent, LinkControl, VoiceLink, VoiceTransport};
use sibyl_voice::{SessionConfig, SessionDeps, SessionError, VoiceSession};

// --- fakes ---

#[derive(Default)]
struct FakeControl {
    speaking: Mutex<Vec<bool>>,
    switches: AtomicUsize,
    disconnects: AtomicUsize,
}

#[async_trait]
impl LinkControl for FakeControl {
    async fn set_speaking(&self, speaking: bool) -> anyhow::Result<()> {
        self.speaking.lock().unwrap().push(speaking);
        Ok(())
    }

    async fn switch_channel(&self, _channel_id: &str) -> anyhow::Result<()> {
        self.switches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeTransport {
    joins: AtomicUsize,
    event_tx: Mutex<Option<mpsc::Sender<GatewayEvent>>>,
    opus_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    control: Mutex<Option<Arc<FakeControl>>>,
}

impl FakeTransport {
    fn events(&self) -> mpsc::Sender<GatewayEvent> {
        self.event_tx.lock().unwrap().clone().expect("not joined")
    }

    fn control(&self) -> Arc<FakeControl> {
        self.control.lock().unwrap().clone().expect("not joined")
    }
}

#[async_trait]
impl VoiceTransport for FakeTransport {
    async fn join(&self, guild_id: &str, channel_id: &str) -> anyhow::Result<VoiceLink> {
        self.joins.fetch_add(1, Ordering::SeqCst);

        let (event_tx, events) = mpsc::channel(256);
        let (opus_tx, opus_rx) = mpsc::channel(256);
        let control = Arc::new(FakeControl::default());

        *self.event_tx.lock().unwrap() = Some(event_tx);
        *self.opus_rx.lock().unwrap() = Some(opus_rx);
        *self.control.lock().unwrap() = Some(Arc::clone(&control));

        Ok(VoiceLink {
            guild_id: guild_id.into(),
            channel_id: channel_id.into(),
            events,
            opus_tx,
            control,
        })
    }
}

#[derive(Default)]
struct FakeTranscriber {
    transcripts: Mutex<Vec<String>>,
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, wav: &Path) -> anyhow::Result<String> {
        assert!(wav.exists(), "capture should exist during transcription");
        let text = "sibyl, how are you?".to_string();
        self.transcripts.lock().unwrap().push(text.clone());
        Ok(text)
    }
}

/// Brain that records inputs and stays silent (no spoken lines).
#[derive(Default)]
struct FakeBrain {
    turns: AtomicUsize,
    last_input: Mutex<Option<String>>,
    delay: Option<Duration>,
}

impl FakeBrain {
    fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChatBrain for FakeBrain {
    async fn run_turn(
        &self,
        turn: TurnRequest,
        _sink: Arc<LinePipe>,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        self.turns.fetch_add(1, Ordering::SeqCst);
        *self.last_input.lock().unwrap() = turn.message.content.clone();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut history = turn.history;
        history.push(turn.message);
        Ok(history)
    }
}

struct FakeTts;

#[async_trait]
impl TextToSpeech for FakeTts {
    async fn stream_speech(&self, _text: &str) -> anyhow::Result<SpeechStream> {
        Ok(Box::pin(std::io::Cursor::new(Vec::new())))
    }

    async fn voices(&self) -> anyhow::Result<Vec<Voice>> {
        Ok(vec![Voice {
            voice_id: "v1".into(),
            name: "Test".into(),
        }])
    }

    async fn set_voice(&self, _name_or_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn active_voice(&self) -> String {
        "v1".into()
    }
}

struct Harness {
    session: Arc<VoiceSession>,
    transport: Arc<FakeTransport>,
    transcriber: Arc<FakeTranscriber>,
    brain: Arc<FakeBrain>,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

fn harness(brain: FakeBrain) -> Harness {
    let capture = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let transport = Arc::new(FakeTransport::default());
    let transcriber = Arc::new(FakeTranscriber::default());
    let brain = Arc::new(brain);

    let config = SessionConfig {
        utterance_timeout: Duration::from_millis(80),
        min_utterance: Duration::from_millis(500),
        upload_min: Duration::from_secs(3),
        wake_word: Some("sibyl".into()),
        use_mixer: true,
        playback_volume: 1.0,
        capture_dir: capture.path().to_path_buf(),
        cache_dir: cache.path().to_path_buf(),
    };
    let deps = SessionDeps {
        transport: Arc::clone(&transport) as Arc<dyn VoiceTransport>,
        transcriber: Arc::clone(&transcriber) as Arc<dyn Transcriber>,
        brain: Arc::clone(&brain) as Arc<dyn ChatBrain>,
        tts: Arc::new(FakeTts),
        store: None,
    };

    Harness {
        session: VoiceSession::new(config, deps),
        transport,
        transcriber,
        brain,
        _dirs: (capture, cache),
    }
}

/// Valid Opus frames: `count` frames of encoded silence for one source.
fn opus_frames(ssrc: u32, count: usize) -> Vec<AudioFrame> {
    let mut encoder = OpusEncoder::new().unwrap();
    (0..count)
        .map(|i| AudioFrame {
            ssrc,
            sequence: i as u16,
            timestamp: (i * FRAME_SAMPLES) as u32,
            opus: encoder.encode(&vec![120i16; FRAME_LEN]).unwrap(),
        })
        .collect()
}

async fn send_mapped_utterance(transport: &FakeTransport, ssrc: u32, user: &str, frames: usize) {
    let events = transport.events();
    events
        .send(GatewayEvent::Speaking {
            ssrc,
            user_id: user.into(),
        })
        .await
        .unwrap();
    for frame in opus_frames(ssrc, frames) {
        events.send(GatewayEvent::Frame(frame)).await.unwrap();
    }
}

// --- tests ---

#[tokio::test]
async fn test_join_wrong_guild_rejected_without_touching_connection() {
    let h = harness(FakeBrain::default());

    h.session.join("guild-1", "channel-1").await.unwrap();
    let err = h.session.join("guild-2", "channel-9").await.unwrap_err();

    assert_eq!(err, SessionError::WrongGuild);
    assert_eq!(h.transport.joins.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.connected_guild().as_deref(), Some("guild-1"));
    assert_eq!(h.session.current_channel().as_deref(), Some("channel-1"));

    h.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_join_same_guild_switches_channel_in_place() {
    let h = harness(FakeBrain::default());

    h.session.join("guild-1", "channel-1").await.unwrap();
    h.session.join("guild-1", "channel-2").await.unwrap();

    assert_eq!(h.transport.joins.load(Ordering::SeqCst), 1);
    assert_eq!(h.transport.control().switches.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.current_channel().as_deref(), Some("channel-2"));

    h.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_leave_when_not_connected() {
    let h = harness(FakeBrain::default());
    assert_eq!(h.session.leave().await.unwrap_err(), SessionError::NotConnected);
}

#[tokio::test]
async fn test_leave_is_terminal_and_idempotent() {
    let h = harness(FakeBrain::default());

    h.session.join("guild-1", "channel-1").await.unwrap();
    h.session.leave().await.unwrap();

    assert!(!h.session.is_connected());
    assert_eq!(h.transport.control().disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(h.session.leave().await.unwrap_err(), SessionError::NotConnected);
}

#[tokio::test]
async fn test_utterance_flows_through_transcription_into_a_turn() {
    let h = harness(FakeBrain::default());
    h.session.join("guild-1", "channel-1").await.unwrap();

    // 30 frames = 600ms of audio, past the 500ms minimum
    send_mapped_utterance(&h.transport, 11, "alice", 30).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.brain.turns.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("turn never ran");

    assert_eq!(h.transcriber.transcripts.lock().unwrap().len(), 1);
    assert_eq!(
        h.brain.last_input.lock().unwrap().as_deref(),
        Some("sibyl, how are you?")
    );

    h.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_short_utterance_dropped_before_transcription() {
    let h = harness(FakeBrain::default());
    h.session.join("guild-1", "channel-1").await.unwrap();

    // 5 frames = 100ms, under the minimum duration filter
    send_mapped_utterance(&h.transport, 11, "alice", 5).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(h.transcriber.transcripts.lock().unwrap().is_empty());
    assert_eq!(h.brain.turns.load(Ordering::SeqCst), 0);

    h.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_unmapped_frames_dropped_until_signaling_arrives() {
    let h = harness(FakeBrain::default());
    h.session.join("guild-1", "channel-1").await.unwrap();

    // frames race ahead of their Speaking event: dropped, not queued
    let events = h.transport.events();
    for frame in opus_frames(11, 30) {
        events.send(GatewayEvent::Frame(frame)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.brain.turns.load(Ordering::SeqCst), 0);

    // once the mapping lands, frames flow
    send_mapped_utterance(&h.transport, 11, "alice", 30).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.brain.turns.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("turn never ran after mapping");

    h.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_utterance_shed_while_turn_in_flight() {
    let h = harness(FakeBrain::slow(Duration::from_millis(1500)));
    h.session.join("guild-1", "channel-1").await.unwrap();

    send_mapped_utterance(&h.transport, 11, "alice", 30).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.brain.turns.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("first turn never started");

    // second utterance arrives while the slow turn holds the try-lock
    send_mapped_utterance(&h.transport, 12, "bob", 30).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    // transcribed, but shed at the turn lock
    assert_eq!(h.transcriber.transcripts.lock().unwrap().len(), 2);
    assert_eq!(h.brain.turns.load(Ordering::SeqCst), 1);

    h.session.leave().await.unwrap();
}

#[tokio::test]
async fn test_leave_mid_turn_does_not_deadlock() {
    let h = harness(FakeBrain::slow(Duration::from_secs(2)));
    h.session.join("guild-1", "channel-1").await.unwrap();

    send_mapped_utterance(&h.transport, 11, "alice", 30).await;
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.brain.turns.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("turn never started");

    tokio::time::timeout(Duration::from_secs(5), h.session.leave())
        .await
        .expect("leave deadlocked")
        .unwrap();
    assert!(!h.session.is_connected());
}
