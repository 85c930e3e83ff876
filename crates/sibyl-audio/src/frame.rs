//! Audio data types and fixed stream parameters.

use std::time::Duration;

/// Interleaved channel count (stereo).
pub const CHANNELS: usize = 2;
/// Sampling rate in Hz.
pub const SAMPLE_RATE: usize = 48_000;
/// Samples per channel in one 20 ms frame.
pub const FRAME_SAMPLES: usize = 960;
/// Total i16 samples in one interleaved frame.
pub const FRAME_LEN: usize = FRAME_SAMPLES * CHANNELS;
/// Upper bound for one encoded Opus frame.
pub const MAX_OPUS_BYTES: usize = FRAME_LEN * 2;
/// Wall-clock duration of one frame.
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// One compressed audio frame crossing the voice gateway.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Numeric source identifier tagging the originating speaker stream.
    pub ssrc: u32,
    /// Gateway sequence number.
    pub sequence: u16,
    /// Gateway sample timestamp.
    pub timestamp: u32,
    /// Opaque compressed payload.
    pub opus: Vec<u8>,
}

/// One decoded 20 ms frame: `FRAME_LEN` interleaved 16-bit samples.
pub type PcmFrame = Vec<i16>;

/// Wall-clock duration of a run of PCM frames.
pub fn pcm_duration(frames: &[PcmFrame]) -> Duration {
    let total: usize = frames.iter().map(|f| f.len()).sum();
    let seconds = total as f64 / (SAMPLE_RATE as f64 * CHANNELS as f64);
    Duration::from_secs_f64(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_duration() {
        // 50 full frames = 1 second of stereo 48kHz audio
        let frames: Vec<PcmFrame> = (0..50).map(|_| vec![0i16; FRAME_LEN]).collect();
        assert_eq!(pcm_duration(&frames), Duration::from_secs(1));
    }

    #[test]
    fn test_pcm_duration_empty() {
        assert_eq!(pcm_duration(&[]), Duration::ZERO);
    }
}
