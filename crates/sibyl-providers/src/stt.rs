//! Speech-to-text over a Whisper-compatible HTTP endpoint.

use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use crate::Transcriber;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_MODEL: &str = "whisper-1";

pub struct WhisperHttp {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    prompt: Option<String>,
}

impl WhisperHttp {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.into(),
            prompt: None,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Vocabulary hint sent with every request: names the model would
    /// otherwise mis-hear.
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

#[async_trait]
impl Transcriber for WhisperHttp {
    async fn transcribe(&self, wav: &Path) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(wav).await?;
        debug!(file = %wav.display(), wav_bytes = bytes.len(), "sending audio for transcription");

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "text")
            .part("file", part);
        if let Some(prompt) = &self.prompt {
            form = form.text("prompt", prompt.clone());
        }

        let resp = self
            .client
            .post(format!("{}/v1/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("transcription API error {status}: {body}");
        }

        Ok(resp.text().await?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let stt = WhisperHttp::new("key");
        assert_eq!(stt.base_url, DEFAULT_BASE_URL);
        assert_eq!(stt.model, DEFAULT_MODEL);
        assert!(stt.prompt.is_none());
    }

    #[test]
    fn test_builder_overrides() {
        let stt = WhisperHttp::new("key")
            .with_base_url("https://api.groq.com/openai/")
            .with_model("whisper-large-v3-turbo")
            .with_prompt("Sibyl");
        assert_eq!(stt.base_url, "https://api.groq.com/openai");
        assert_eq!(stt.model, "whisper-large-v3-turbo");
        assert_eq!(stt.prompt.as_deref(), Some("Sibyl"));
    }
}
