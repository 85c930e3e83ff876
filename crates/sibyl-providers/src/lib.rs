//! Provider boundaries: transcription, chat completion, speech synthesis.
//!
//! The session controller only sees these traits; the concrete adapters in
//! this crate are thin `reqwest` clients for the usual HTTP providers.

pub mod completion;
pub mod sse;
pub mod stt;
pub mod tts;

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use sibyl_core::pipe::LinePipe;

/// Chat message in the OpenAI-compatible wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: Some(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>, name: Option<String>) -> Self {
        Self {
            role: "user".into(),
            content: Some(content.into()),
            name,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: Some(content.into()),
            name: Some(name.into()),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// A function definition offered to the model.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A callable side effect the model may invoke mid-turn.
///
/// `Err` aborts the turn; anything the model should read back (including
/// refusals like "user is not in a voice chat") is returned as the result
/// string.
#[async_trait]
pub trait ChatFunction: Send + Sync {
    fn definition(&self) -> FunctionDef;
    async fn call(&self, args: serde_json::Value) -> anyhow::Result<String>;
}

/// One streamed model turn.
pub struct TurnRequest {
    pub system: ChatMessage,
    pub history: Vec<ChatMessage>,
    pub message: ChatMessage,
    pub functions: Vec<Arc<dyn ChatFunction>>,
}

#[async_trait]
pub trait ChatBrain: Send + Sync {
    /// Run one turn, streaming assistant text into `sink` as it arrives and
    /// dispatching tool calls. Returns the updated history.
    async fn run_turn(
        &self,
        turn: TurnRequest,
        sink: Arc<LinePipe>,
    ) -> anyhow::Result<Vec<ChatMessage>>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe a WAV capture to text.
    async fn transcribe(&self, wav: &Path) -> anyhow::Result<String>;
}

/// A named synthesis voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
}

/// Streamed MP3 speech bytes.
pub type SpeechStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Stream synthesized speech for one line of text.
    async fn stream_speech(&self, text: &str) -> anyhow::Result<SpeechStream>;
    /// List available voices.
    async fn voices(&self) -> anyhow::Result<Vec<Voice>>;
    /// Switch the active voice by name or id.
    async fn set_voice(&self, name_or_id: &str) -> anyhow::Result<()>;
    /// Identifier of the active voice, used for cache keying.
    fn active_voice(&self) -> String;
}
