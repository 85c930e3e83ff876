//! The utterance → transcription → generation → speech turn pipeline.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use sibyl_audio::capture;
use sibyl_audio::codec;
use sibyl_audio::frame::PcmFrame;
use sibyl_audio::ffmpeg;
use sibyl_audio::segmenter::Utterance;
use sibyl_core::pipe::LinePipe;
use sibyl_providers::{ChatFunction, ChatMessage, FunctionDef, TextToSpeech, TurnRequest};

use crate::session::{SessionError, VoiceSession};

const VOICE_SYSTEM_PROMPT: &str = "You are Sibyl, a friendly companion in a group voice chat. \
Your replies are spoken aloud: answer in short conversational sentences, one thought per line, \
no markup. People currently in the chat: {speakers}.";

const SPEECH_BUF: usize = 32 * 1024;

impl VoiceSession {
    pub(crate) async fn handle_utterance(&self, utterance: Utterance) {
        if let Err(e) = self.process_utterance(utterance).await {
            error!(%e, "failed to handle utterance");
        }
    }

    async fn process_utterance(&self, utterance: Utterance) -> anyhow::Result<()> {
        let started = Instant::now();
        let speaker = utterance.speaker.clone();

        let duration = codec::frames_duration(&utterance.frames)?;
        if duration < self.config.min_utterance {
            debug!(speaker = %speaker, ?duration, "audio clip too short");
            return Ok(());
        }

        // the capture feeds transcription and, when notable, the archive
        let wav = capture::write_utterance_wav(&utterance.frames, &self.config.capture_dir)?;

        let text = match self.deps.transcriber.transcribe(&wav).await {
            Ok(text) => text,
            Err(e) => {
                error!(%e, "transcription failed");
                let _ = tokio::fs::remove_file(&wav).await;
                return Ok(()); // transient provider failure aborts the turn
            }
        };

        if duration >= self.config.upload_min {
            if let Some(store) = &self.deps.store {
                let file = wav.file_name().and_then(|n| n.to_str()).unwrap_or("capture.wav");
                let key = format!("user-audio/{speaker}/{file}");
                match store.put_file(&wav, &key).await {
                    Ok(()) => {
                        if let Some(url) = store.public_url(&key) {
                            debug!(url, "capture uploaded");
                        }
                    }
                    Err(e) => warn!(%e, key, "capture upload failed"),
                }
            }
        }
        let _ = tokio::fs::remove_file(&wav).await;

        // wake-word gate before burning a model call
        if let Some(wake) = &self.config.wake_word {
            if !text.to_lowercase().contains(&wake.to_lowercase()) {
                debug!(text = %text, "dropped utterance without wake word");
                return Ok(());
            }
        }

        // single in-flight turn; overlapping utterances are shed, not queued
        let Ok(_turn) = self.turn_lock.try_lock() else {
            warn!(speaker = %speaker, "missed spoken message due to processing");
            return Ok(());
        };

        if !self.is_connected() {
            return Ok(()); // left voice while transcribing
        }

        info!(speaker = %speaker, clip = ?duration, input = %text, "processing spoken message");
        self.run_turn(&speaker, &text).await?;
        debug!(elapsed = ?started.elapsed(), "audio chat handling done");
        Ok(())
    }

    /// One model turn: generation streams lines into a pipe while the
    /// speaking half synthesizes and sends them as they arrive.
    async fn run_turn(&self, speaker: &str, text: &str) -> anyhow::Result<()> {
        let system = ChatMessage::system(self.system_prompt());
        let history = self.history.lock().unwrap().clone();
        let message = ChatMessage::user(text, Some(speaker.to_string()));
        let functions = self.chat_functions();

        let pipe = Arc::new(LinePipe::new());

        let brain = Arc::clone(&self.deps.brain);
        let generation_pipe = Arc::clone(&pipe);
        let generation = async move {
            let result = brain
                .run_turn(
                    TurnRequest {
                        system,
                        history,
                        message,
                        functions,
                    },
                    Arc::clone(&generation_pipe),
                )
                .await;
            // close regardless so the speaking half always reaches EOF
            let _ = generation_pipe.close();
            result
        };

        let speaking = async {
            let mut spoke = false;
            let mut result = Ok(());
            while let Some(line) = pipe.read_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if result.is_err() || !self.is_connected() {
                    continue; // keep draining the pipe, but stay quiet
                }
                if !spoke {
                    self.signal_speaking(true).await;
                    spoke = true;
                }
                debug!(line = %line, "speaking message");
                if let Err(e) = self.speak_line(line).await {
                    result = Err(e);
                }
            }
            if spoke {
                self.signal_speaking(false).await;
            }
            result
        };

        let (new_history, spoken) = tokio::join!(generation, speaking);
        let new_history = new_history?;
        spoken?;

        *self.history.lock().unwrap() = new_history;
        Ok(())
    }

    /// Synthesize one line and route it outbound: through the mixer when
    /// enabled, straight to the encoder otherwise.
    async fn speak_line(&self, line: &str) -> anyhow::Result<()> {
        enum Route {
            Mixer(mpsc::Sender<PcmFrame>),
            Direct(mpsc::Sender<Vec<u8>>),
        }

        let route = {
            let active = self.active.lock().unwrap();
            let Some(conn) = active.as_ref() else {
                return Err(SessionError::NotConnected.into());
            };
            match conn.mixer.as_ref() {
                Some(mixer) => Route::Mixer(mixer.create()),
                None => Route::Direct(conn.opus_tx.clone()),
            }
        };

        let (reader, writer) = tokio::io::duplex(SPEECH_BUF);
        let playback = async move {
            match route {
                Route::Mixer(source) => ffmpeg::stream_mp3_to_pcm(reader, 1.0, source).await,
                Route::Direct(opus_tx) => ffmpeg::stream_mp3_to_opus(reader, 1.0, opus_tx).await,
            }
        };

        let (fed, played) = tokio::join!(self.feed_speech(line, writer), playback);
        fed?;
        played?;
        Ok(())
    }

    /// Feed MP3 bytes for `line` into `writer`: replay the content-hash
    /// cache when this exact line was spoken before, otherwise stream from
    /// the provider while teeing into the cache.
    async fn feed_speech(&self, line: &str, mut writer: DuplexStream) -> anyhow::Result<()> {
        let key = speech_cache_key(&self.deps.tts.active_voice(), line);
        let cache_path = self.config.cache_dir.join(format!("{key}.mp3"));

        if tokio::fs::metadata(&cache_path).await.is_ok() {
            debug!(path = %cache_path.display(), "speech cache hit");
            let mut file = tokio::fs::File::open(&cache_path).await?;
            tokio::io::copy(&mut file, &mut writer).await?;
            writer.shutdown().await?;
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.cache_dir).await?;
        let mut speech = self.deps.tts.stream_speech(line).await?;

        let partial = cache_path.with_extension("part");
        let mut cache_file = tokio::fs::File::create(&partial).await?;
        let mut buf = vec![0u8; 8192];
        loop {
            let n = speech.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            cache_file.write_all(&buf[..n]).await?;
            writer.write_all(&buf[..n]).await?;
        }
        cache_file.flush().await?;
        drop(cache_file);
        tokio::fs::rename(&partial, &cache_path).await?;

        writer.shutdown().await?;
        Ok(())
    }

    async fn signal_speaking(&self, speaking: bool) {
        let control = {
            self.active
                .lock()
                .unwrap()
                .as_ref()
                .map(|conn| Arc::clone(&conn.control))
        };
        if let Some(control) = control {
            if let Err(e) = control.set_speaking(speaking).await {
                warn!(%e, "failed to signal speaking state");
            }
        }
    }

    fn system_prompt(&self) -> String {
        let speakers: Vec<String> = {
            let active = self.active.lock().unwrap();
            active
                .as_ref()
                .map(|conn| conn.speakers.read().unwrap().values().cloned().collect())
                .unwrap_or_default()
        };
        VOICE_SYSTEM_PROMPT.replace("{speakers}", &speakers.join(", "))
    }

    /// Functions the model may call mid-turn.
    fn chat_functions(&self) -> Vec<Arc<dyn ChatFunction>> {
        vec![
            Arc::new(LeaveChannelFn {
                session: self.weak.clone(),
            }) as Arc<dyn ChatFunction>,
            Arc::new(GetVoicesFn {
                tts: Arc::clone(&self.deps.tts),
            }),
            Arc::new(SetVoiceFn {
                tts: Arc::clone(&self.deps.tts),
            }),
        ]
    }
}

/// Content-hash key for a synthesized line, scoped by voice so a voice
/// switch never replays the wrong rendition.
pub(crate) fn speech_cache_key(voice: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(voice.as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// --- chat functions ---

struct LeaveChannelFn {
    session: Weak<VoiceSession>,
}

#[async_trait]
impl ChatFunction for LeaveChannelFn {
    fn definition(&self) -> FunctionDef {
        FunctionDef {
            name: "leave_voice_chat".into(),
            description: "Disconnect from the voice chat.".into(),
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
        }
    }

    async fn call(&self, _args: serde_json::Value) -> anyhow::Result<String> {
        let Some(session) = self.session.upgrade() else {
            return Ok("the session is already gone".into());
        };
        match session.leave().await {
            Ok(()) => Ok("disconnected successfully".into()),
            Err(SessionError::NotConnected) => Ok("not in a voice chat".into()),
            Err(e) => Err(e.into()),
        }
    }
}

struct GetVoicesFn {
    tts: Arc<dyn TextToSpeech>,
}

#[async_trait]
impl ChatFunction for GetVoicesFn {
    fn definition(&self) -> FunctionDef {
        FunctionDef {
            name: "get_voices".into(),
            description: "Get all supported speech voice names and IDs.".into(),
            parameters: json!({ "type": "object", "properties": {}, "required": [] }),
        }
    }

    async fn call(&self, _args: serde_json::Value) -> anyhow::Result<String> {
        let voices = self.tts.voices().await?;
        Ok(serde_json::to_string(&voices)?)
    }
}

struct SetVoiceFn {
    tts: Arc<dyn TextToSpeech>,
}

#[async_trait]
impl ChatFunction for SetVoiceFn {
    fn definition(&self) -> FunctionDef {
        FunctionDef {
            name: "set_voice".into(),
            description: "Set the speech voice by name or ID.".into(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "name_or_id": {
                        "type": "string",
                        "description": "Desired voice name or ID."
                    }
                },
                "required": ["name_or_id"]
            }),
        }
    }

    async fn call(&self, args: serde_json::Value) -> anyhow::Result<String> {
        let name_or_id = args
            .get("name_or_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing 'name_or_id'"))?;
        self.tts.set_voice(name_or_id).await?;
        Ok("voice set".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speech_cache_key_stable() {
        assert_eq!(
            speech_cache_key("rachel", "hello there"),
            speech_cache_key("rachel", "hello there"),
        );
        assert_eq!(speech_cache_key("rachel", "hello").len(), 64);
    }

    #[test]
    fn test_speech_cache_key_scoped_by_voice() {
        assert_ne!(
            speech_cache_key("rachel", "hello"),
            speech_cache_key("elli", "hello"),
        );
        assert_ne!(
            speech_cache_key("rachel", "hello"),
            speech_cache_key("rachel", "goodbye"),
        );
    }
}
