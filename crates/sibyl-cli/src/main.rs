use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use sibyl_core::config::Config;
use sibyl_providers::tts::ElevenLabsTts;
use sibyl_providers::TextToSpeech;

#[derive(Parser)]
#[command(name = "sibyl", about = "Voice companion core utilities", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print a summary
    Check,

    /// Synthesize a line of speech to a file (provider smoke test)
    Say {
        /// Text to speak
        text: String,

        /// Output file (defaults to a timestamped MP3 in the data dir)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Check => check(&config),
        Commands::Say { text, out } => say(&config, &text, out).await,
    }
}

fn check(config: &Config) -> anyhow::Result<()> {
    let stt = config
        .transcription
        .as_ref()
        .and_then(|c| c.resolve_api_key())
        .is_some();
    let completion = config
        .completion
        .as_ref()
        .and_then(|c| c.resolve_api_key())
        .is_some();
    let tts = config.tts.as_ref().and_then(|c| c.resolve_api_key()).is_some();

    println!("transcription key: {}", if stt { "ok" } else { "missing" });
    println!("completion key:    {}", if completion { "ok" } else { "missing" });
    println!("tts key:           {}", if tts { "ok" } else { "missing" });
    println!();
    println!("utterance timeout: {}ms", config.voice.utterance_timeout_ms);
    println!("min utterance:     {}ms", config.voice.min_utterance_ms);
    println!(
        "wake word:         {}",
        config.voice.wake_word.as_deref().unwrap_or("(none)")
    );
    println!("mixer:             {}", config.voice.mixer);
    println!("capture dir:       {}", config.capture_dir().display());
    println!("speech cache:      {}", config.cache_dir().display());

    if !(stt && completion && tts) {
        anyhow::bail!("one or more provider keys are missing");
    }
    Ok(())
}

async fn say(config: &Config, text: &str, out: Option<PathBuf>) -> anyhow::Result<()> {
    let tts_config = config
        .tts
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no tts section in config"))?;
    let api_key = tts_config
        .resolve_api_key()
        .ok_or_else(|| anyhow::anyhow!("no tts api key configured"))?;

    let mut tts = ElevenLabsTts::new(api_key);
    if let Some(model) = &tts_config.default_model {
        tts = tts.with_model(model.clone());
    }
    if let Some(voice) = &tts_config.default_voice {
        tts = tts.with_voice(voice.clone());
    }

    let path = out.unwrap_or_else(|| output_filename(&sibyl_core::config::data_dir()));
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut speech = tts.stream_speech(text).await?;
    let mut file = tokio::fs::File::create(&path).await?;
    let bytes = tokio::io::copy(&mut speech, &mut file).await?;
    file.flush().await?;

    tracing::info!(path = %path.display(), bytes, "speech written");
    println!("{}", path.display());
    Ok(())
}

/// Unique output filename under the data dir.
fn output_filename(base: &Path) -> PathBuf {
    let ts = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    base.join("audio").join(format!("say_{ts}_{}.mp3", &id[..8]))
}
