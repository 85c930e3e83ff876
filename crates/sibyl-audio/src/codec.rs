//! Opus encode/decode at the fixed 48 kHz stereo, 20 ms framing.

use std::time::Duration;

use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Channels, SampleRate};

use crate::frame::{pcm_duration, AudioFrame, PcmFrame, FRAME_LEN, FRAME_SAMPLES, MAX_OPUS_BYTES};
use crate::AudioError;

/// Stateful Opus decoder. Construct one per logical stream; the codec
/// carries inter-frame prediction state.
pub struct OpusDecoder {
    inner: Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, AudioError> {
        Ok(Self {
            inner: Decoder::new(SampleRate::Hz48000, Channels::Stereo)?,
        })
    }

    /// Decode one compressed frame into a fixed-length PCM frame.
    pub fn decode(&mut self, opus: &[u8]) -> Result<PcmFrame, AudioError> {
        let mut pcm = vec![0i16; FRAME_LEN];
        let samples = self.inner.decode(Some(opus), &mut pcm, false)?;
        if samples != FRAME_SAMPLES {
            return Err(AudioError::FrameSize {
                got: samples,
                want: FRAME_SAMPLES,
            });
        }
        Ok(pcm)
    }

    /// Decode an ordered run of frames.
    pub fn decode_frames(&mut self, frames: &[AudioFrame]) -> Result<Vec<PcmFrame>, AudioError> {
        frames.iter().map(|f| self.decode(&f.opus)).collect()
    }
}

/// Stateful fixed-bitrate Opus encoder, symmetric to [`OpusDecoder`].
pub struct OpusEncoder {
    inner: Encoder,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, AudioError> {
        Ok(Self {
            inner: Encoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)?,
        })
    }

    /// Encode one fixed-length PCM frame.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>, AudioError> {
        if pcm.len() != FRAME_LEN {
            return Err(AudioError::FrameSize {
                got: pcm.len(),
                want: FRAME_LEN,
            });
        }
        let mut out = vec![0u8; MAX_OPUS_BYTES];
        let written = self.inner.encode(pcm, &mut out)?;
        out.truncate(written);
        Ok(out)
    }

    /// Encode an ordered run of PCM frames.
    pub fn encode_frames(&mut self, frames: &[PcmFrame]) -> Result<Vec<Vec<u8>>, AudioError> {
        frames.iter().map(|f| self.encode(f)).collect()
    }
}

/// Decode an utterance and report its wall-clock duration.
pub fn frames_duration(frames: &[AudioFrame]) -> Result<Duration, AudioError> {
    let mut decoder = OpusDecoder::new()?;
    let pcm = decoder.decode_frames(frames)?;
    Ok(pcm_duration(&pcm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_signal(seed: i16) -> PcmFrame {
        (0..FRAME_LEN)
            .map(|i| ((i as i16).wrapping_mul(seed) % 800).wrapping_mul(20))
            .collect()
    }

    #[test]
    fn test_round_trip_preserves_frame_counts() {
        let pcm: Vec<PcmFrame> = (1..=5).map(test_signal).collect();

        let mut encoder = OpusEncoder::new().unwrap();
        let packets = encoder.encode_frames(&pcm).unwrap();
        assert_eq!(packets.len(), 5);

        let mut decoder = OpusDecoder::new().unwrap();
        let decoded: Vec<PcmFrame> = packets
            .iter()
            .map(|p| decoder.decode(p).unwrap())
            .collect();

        // lossy codec: counts survive, samples need not be byte-exact
        assert_eq!(decoded.len(), pcm.len());
        let total_in: usize = pcm.iter().map(|f| f.len()).sum();
        let total_out: usize = decoded.iter().map(|f| f.len()).sum();
        assert_eq!(total_in, total_out);
    }

    #[test]
    fn test_encode_rejects_short_frame() {
        let mut encoder = OpusEncoder::new().unwrap();
        let err = encoder.encode(&vec![0i16; FRAME_LEN / 2]).unwrap_err();
        assert!(matches!(
            err,
            AudioError::FrameSize { got, want } if got == FRAME_LEN / 2 && want == FRAME_LEN
        ));
    }

    #[test]
    fn test_frames_duration() {
        let mut encoder = OpusEncoder::new().unwrap();
        let frames: Vec<AudioFrame> = (0..25)
            .map(|i| AudioFrame {
                ssrc: 1,
                sequence: i as u16,
                timestamp: (i * FRAME_SAMPLES) as u32,
                opus: encoder.encode(&test_signal(3)).unwrap(),
            })
            .collect();

        // 25 frames of 20ms = 500ms
        let duration = frames_duration(&frames).unwrap();
        assert_eq!(duration, Duration::from_millis(500));
    }
}
