//! Per-speaker utterance segmentation by idle timeout.
//!
//! Frames pushed for a speaker accumulate until that speaker goes quiet for
//! the configured timeout; the buffered run is then delivered exactly once,
//! in push order, as a completed utterance. Short utterances are NOT
//! filtered here; that belongs to the caller, upstream of transcription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::frame::AudioFrame;

/// A contiguous run of frames from one speaker, bounded by silence.
#[derive(Debug)]
pub struct Utterance {
    pub speaker: String,
    pub frames: Vec<AudioFrame>,
}

struct Pending {
    frames: Vec<AudioFrame>,
    deadline: Instant,
}

pub struct Segmenter {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    timeout: Duration,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Segmenter {
    /// Start a segmenter. Completed utterances arrive on the returned
    /// receiver as speakers go idle.
    pub fn start(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<Utterance>) {
        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let pending: Arc<Mutex<HashMap<String, Pending>>> = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        let sweep_every = (timeout / 5).max(Duration::from_millis(5));
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&pending),
            utterance_tx,
            sweep_every,
            cancel.clone(),
        ));

        (
            Self {
                pending,
                timeout,
                cancel,
                sweeper: Mutex::new(Some(sweeper)),
            },
            utterance_rx,
        )
    }

    /// Append a frame to the speaker's in-flight utterance and push its
    /// idle deadline back.
    pub fn push(&self, speaker: &str, frame: AudioFrame) {
        let deadline = Instant::now() + self.timeout;
        let mut pending = self.pending.lock().unwrap();
        let entry = pending
            .entry(speaker.to_string())
            .or_insert_with(|| Pending {
                frames: Vec::new(),
                deadline,
            });
        entry.frames.push(frame);
        entry.deadline = deadline;
    }

    /// Speakers with an in-flight utterance.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Stop the sweeper. In-flight buffers are discarded.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
    }
}

async fn sweep_loop(
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    utterance_tx: mpsc::UnboundedSender<Utterance>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        // remove expired entries under the lock, deliver outside it
        let expired: Vec<(String, Vec<AudioFrame>)> = {
            let mut pending = pending.lock().unwrap();
            let idle: Vec<String> = pending
                .iter()
                .filter(|(_, p)| p.deadline <= now)
                .map(|(speaker, _)| speaker.clone())
                .collect();
            idle.into_iter()
                .filter_map(|speaker| {
                    pending
                        .remove(&speaker)
                        .map(|p| (speaker, p.frames))
                })
                .collect()
        };

        for (speaker, frames) in expired {
            debug!(speaker = %speaker, frames = frames.len(), "utterance complete");
            if utterance_tx.send(Utterance { speaker, frames }).is_err() {
                return; // consumer gone, nothing left to deliver to
            }
        }
    }
}
