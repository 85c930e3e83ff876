//! Audio pipeline primitives: fixed 20 ms framing, Opus transcode, external
//! ffmpeg streaming, WAV capture, PCM mixing, and speech segmentation.

pub mod capture;
pub mod codec;
pub mod ffmpeg;
pub mod frame;
pub mod mixer;
pub mod segmenter;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("opus codec error: {0}")]
    Opus(#[from] audiopus::Error),

    #[error("unexpected frame size: got {got} samples, want {want}")]
    FrameSize { got: usize, want: usize },

    #[error("failed to start ffmpeg: {0}")]
    DecoderSpawn(std::io::Error),

    #[error("decoder stream error: {0}")]
    DecoderStream(std::io::Error),

    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),

    #[error("output queue closed")]
    OutputClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
