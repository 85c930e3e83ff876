//! WAV capture of decoded utterances with content-hash naming.

use std::io::{Seek, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::codec::OpusDecoder;
use crate::frame::{AudioFrame, PcmFrame, CHANNELS, SAMPLE_RATE};
use crate::AudioError;

/// Write PCM frames as 16-bit WAV to any seekable sink, frame by frame.
pub fn write_pcm_wav<W: Write + Seek>(frames: &[PcmFrame], sink: W) -> Result<(), AudioError> {
    let spec = hound::WavSpec {
        channels: CHANNELS as u16,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::new(sink, spec)?;
    for frame in frames {
        for &sample in frame {
            writer.write_sample(sample)?;
        }
    }
    writer.finalize()?;
    Ok(())
}

/// SHA-256 over the little-endian PCM bytes: a stable content address for
/// a capture.
pub fn hash_pcm(frames: &[PcmFrame]) -> String {
    let mut hasher = Sha256::new();
    for frame in frames {
        for &sample in frame {
            hasher.update(sample.to_le_bytes());
        }
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Decode an utterance and persist it as `<hash>.wav` under `outdir`.
pub fn write_utterance_wav(frames: &[AudioFrame], outdir: &Path) -> Result<PathBuf, AudioError> {
    std::fs::create_dir_all(outdir)?;

    let mut decoder = OpusDecoder::new()?;
    let pcm = decoder.decode_frames(frames)?;

    let path = outdir.join(format!("{}.wav", hash_pcm(&pcm)));
    let file = std::fs::File::create(&path)?;
    write_pcm_wav(&pcm, std::io::BufWriter::new(file))?;

    Ok(path)
}
