//! Streaming speech synthesis via the ElevenLabs API.

use std::sync::RwLock;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde::Deserialize;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::{SpeechStream, TextToSpeech, Voice};

const BASE_URL: &str = "https://api.elevenlabs.io";
const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM"; // "Rachel"
const DEFAULT_MODEL: &str = "eleven_turbo_v2";

pub struct ElevenLabsTts {
    client: reqwest::Client,
    api_key: String,
    model: String,
    voice_id: RwLock<String>,
}

impl ElevenLabsTts {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            voice_id: RwLock::new(DEFAULT_VOICE_ID.into()),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_voice(self, voice_id: impl Into<String>) -> Self {
        *self.voice_id.write().unwrap() = voice_id.into();
        self
    }

    fn stream_url(voice_id: &str) -> String {
        format!("{BASE_URL}/v1/text-to-speech/{voice_id}/stream")
    }
}

#[derive(Debug, Deserialize)]
struct VoicesResponse {
    voices: Vec<Voice>,
}

#[async_trait]
impl TextToSpeech for ElevenLabsTts {
    async fn stream_speech(&self, text: &str) -> anyhow::Result<SpeechStream> {
        let voice_id = self.active_voice();
        debug!(voice = %voice_id, text_len = text.len(), "starting TTS stream");

        let resp = self
            .client
            .post(Self::stream_url(&voice_id))
            .header("xi-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("TTS API error {status}: {body}");
        }

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn voices(&self) -> anyhow::Result<Vec<Voice>> {
        let resp = self
            .client
            .get(format!("{BASE_URL}/v1/voices"))
            .header("xi-api-key", &self.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            anyhow::bail!("voice listing failed: {status}");
        }

        let parsed: VoicesResponse = resp.json().await?;
        Ok(parsed.voices)
    }

    async fn set_voice(&self, name_or_id: &str) -> anyhow::Result<()> {
        let voices = self.voices().await?;
        let found = voices
            .iter()
            .find(|v| v.voice_id == name_or_id || v.name.eq_ignore_ascii_case(name_or_id))
            .ok_or_else(|| anyhow::anyhow!("no voice named '{name_or_id}'"))?;
        *self.voice_id.write().unwrap() = found.voice_id.clone();
        Ok(())
    }

    fn active_voice(&self) -> String {
        self.voice_id.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_shape() {
        let url = ElevenLabsTts::stream_url("abc123");
        assert!(url.starts_with("https://api.elevenlabs.io"));
        assert!(url.contains("abc123"));
        assert!(url.ends_with("/stream"));
    }

    #[test]
    fn test_default_voice_and_override() {
        let tts = ElevenLabsTts::new("key");
        assert_eq!(tts.active_voice(), DEFAULT_VOICE_ID);

        let tts = tts.with_voice("custom-voice");
        assert_eq!(tts.active_voice(), "custom-voice");
    }
}
