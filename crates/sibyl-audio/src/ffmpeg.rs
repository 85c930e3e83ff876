//! Streaming transcode paths backed by an external ffmpeg process.
//!
//! ffmpeg handles the compressed container formats (MP3 and friends) that
//! the native codec does not; it reads the caller's stream on stdin and
//! emits raw s16le PCM on stdout at the fixed stream parameters.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::codec::OpusEncoder;
use crate::frame::{PcmFrame, CHANNELS, FRAME_LEN, SAMPLE_RATE};
use crate::AudioError;

const STDOUT_BUF: usize = 16 * 1024;

fn spawn_ffmpeg(volume: f64) -> Result<Child, AudioError> {
    let rate = SAMPLE_RATE.to_string();
    let channels = CHANNELS.to_string();
    let filter = format!("volume={volume:.2}");

    Command::new("ffmpeg")
        .args([
            "-i",
            "-",
            "-f",
            "s16le",
            "-ar",
            rate.as_str(),
            "-ac",
            channels.as_str(),
            "-vn", // audio only
            "-filter:a",
            filter.as_str(),
            "pipe:1",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(AudioError::DecoderSpawn)
}

/// Stream-decode compressed audio into fixed-size PCM frames with a volume
/// multiplier applied, forwarding each frame to `sink`.
///
/// The ffmpeg child is killed on every return path. A partial trailing
/// frame at end-of-stream is dropped, not zero-padded. The caller owns
/// closing its reader.
pub async fn stream_mp3_to_pcm<R>(
    reader: R,
    volume: f64,
    sink: mpsc::Sender<PcmFrame>,
) -> Result<(), AudioError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut child = spawn_ffmpeg(volume)?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| AudioError::DecoderSpawn(std::io::Error::other("ffmpeg stdin not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AudioError::DecoderSpawn(std::io::Error::other("ffmpeg stdout not captured")))?;

    // Feed the caller's reader from its own task so a full stdin pipe can
    // never deadlock against our stdout reads. ffmpeg exiting early shows
    // up here as a broken pipe; the read loop reports the real error.
    let feeder = tokio::spawn(async move {
        let mut reader = reader;
        let _ = tokio::io::copy(&mut reader, &mut stdin).await;
        let _ = stdin.shutdown().await;
    });

    let result = read_pcm_frames(stdout, &sink).await;

    let _ = child.kill().await;
    feeder.abort();

    result
}

async fn read_pcm_frames(
    stdout: ChildStdout,
    sink: &mpsc::Sender<PcmFrame>,
) -> Result<(), AudioError> {
    let mut stdout = BufReader::with_capacity(STDOUT_BUF, stdout);
    let mut raw = vec![0u8; FRAME_LEN * 2];
    loop {
        match stdout.read_exact(&mut raw).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(AudioError::DecoderStream(e)),
        }
        let frame: PcmFrame = raw
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        if sink.send(frame).await.is_err() {
            // consumer hung up, stream abandoned
            debug!("pcm sink closed, abandoning decode stream");
            break;
        }
    }
    Ok(())
}

/// Encode PCM frames from `pcm_rx` into Opus frames on `opus_tx`. Runs
/// until the PCM side closes or the consumer hangs up.
pub async fn stream_pcm_to_opus(
    mut encoder: OpusEncoder,
    mut pcm_rx: mpsc::Receiver<PcmFrame>,
    opus_tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), AudioError> {
    while let Some(pcm) = pcm_rx.recv().await {
        let opus = encoder.encode(&pcm)?;
        if opus_tx.send(opus).await.is_err() {
            return Err(AudioError::OutputClosed);
        }
    }
    Ok(())
}

/// Decode compressed audio and re-encode straight to Opus frames: the
/// direct outbound route used when no mixer sits in between.
pub async fn stream_mp3_to_opus<R>(
    reader: R,
    volume: f64,
    opus_tx: mpsc::Sender<Vec<u8>>,
) -> Result<(), AudioError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (pcm_tx, pcm_rx) = mpsc::channel(4);
    let encoder = OpusEncoder::new()?;
    let (decoded, encoded) = tokio::join!(
        stream_mp3_to_pcm(reader, volume, pcm_tx),
        stream_pcm_to_opus(encoder, pcm_rx, opus_tx),
    );
    decoded?;
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_pcm_to_opus_encodes_each_frame() {
        let (pcm_tx, pcm_rx) = mpsc::channel(8);
        let (opus_tx, mut opus_rx) = mpsc::channel(8);

        for seed in 1..=3i16 {
            let frame: PcmFrame = (0..FRAME_LEN).map(|i| (i as i16).wrapping_mul(seed)).collect();
            pcm_tx.send(frame).await.unwrap();
        }
        drop(pcm_tx);

        let encoder = OpusEncoder::new().unwrap();
        stream_pcm_to_opus(encoder, pcm_rx, opus_tx).await.unwrap();

        let mut packets = 0;
        while let Some(packet) = opus_rx.recv().await {
            assert!(!packet.is_empty());
            packets += 1;
        }
        assert_eq!(packets, 3);
    }

    #[tokio::test]
    async fn test_stream_pcm_to_opus_reports_closed_output() {
        let (pcm_tx, pcm_rx) = mpsc::channel(8);
        let (opus_tx, opus_rx) = mpsc::channel::<Vec<u8>>(8);
        drop(opus_rx);

        pcm_tx.send(vec![0i16; FRAME_LEN]).await.unwrap();
        drop(pcm_tx);

        let encoder = OpusEncoder::new().unwrap();
        let err = stream_pcm_to_opus(encoder, pcm_rx, opus_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, AudioError::OutputClosed));
    }
}
