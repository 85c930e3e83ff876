//! Configuration loading and secret resolution.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SibylError};

/// Top-level Sibyl configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<TranscriptionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion: Option<CompletionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(default)]
    pub voice: VoiceConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
}

impl Config {
    /// Load configuration from a JSON5 file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SibylError::Config(format!("failed to read {}: {e}", path.display())))?;
        json5::from_str(&raw).map_err(|e| SibylError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Directory for utterance captures, defaulting under the data dir.
    pub fn capture_dir(&self) -> PathBuf {
        self.voice
            .capture_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("captures"))
    }

    /// Directory for synthesized-speech cache files.
    pub fn cache_dir(&self) -> PathBuf {
        self.voice
            .cache_dir
            .clone()
            .unwrap_or_else(|| data_dir().join("speech-cache"))
    }
}

/// Base data directory (`~/.local/share/sibyl` or platform equivalent).
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sibyl")
}

/// Speech-to-text provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Vocabulary hint passed with every transcription request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
}

impl TranscriptionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Chat completion provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Chat messages retained between turns.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

impl CompletionConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

fn default_history_size() -> usize {
    20
}

/// Speech synthesis provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Voice pipeline tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    /// Silence gap that closes an utterance.
    #[serde(default = "default_utterance_timeout_ms")]
    pub utterance_timeout_ms: u64,

    /// Utterances shorter than this are discarded before transcription.
    #[serde(default = "default_min_utterance_ms")]
    pub min_utterance_ms: u64,

    /// Captures at least this long are forwarded to the object store.
    #[serde(default = "default_upload_min_ms")]
    pub upload_min_ms: u64,

    /// When set, transcripts that don't mention this word are ignored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_word: Option<String>,

    /// Route outbound speech through the mixer so it can combine with
    /// background playback. Disabled, speech encodes straight to the
    /// outbound queue.
    #[serde(default = "default_true")]
    pub mixer: bool,

    /// Volume multiplier for background playback.
    #[serde(default = "default_playback_volume")]
    pub playback_volume: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            utterance_timeout_ms: default_utterance_timeout_ms(),
            min_utterance_ms: default_min_utterance_ms(),
            upload_min_ms: default_upload_min_ms(),
            wake_word: None,
            mixer: true,
            playback_volume: default_playback_volume(),
            capture_dir: None,
            cache_dir: None,
        }
    }
}

fn default_utterance_timeout_ms() -> u64 {
    250
}

fn default_min_utterance_ms() -> u64 {
    500
}

fn default_upload_min_ms() -> u64 {
    3000
}

fn default_playback_volume() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Object storage configuration for capture forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl StorageConfig {
    pub fn resolve_token(&self) -> Option<String> {
        resolve_secret_field(&self.token, &self.token_env)
    }
}

/// Resolve a secret: inline value first, then the named environment variable.
fn resolve_secret_field(value: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(v) = value {
        if !v.is_empty() {
            return Some(v.clone());
        }
    }
    if let Some(name) = env_var {
        if let Ok(v) = std::env::var(name) {
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    None
}
