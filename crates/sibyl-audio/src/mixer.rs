//! N-source PCM fan-in mixer.
//!
//! Sources can be registered while the loop is running; each tick polls
//! every source without blocking, sums whatever arrived, and emits a merged
//! frame only when at least one source contributed. Silent ticks produce no
//! output, so consumers must not expect a periodic heartbeat.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::frame::{PcmFrame, FRAME_DURATION, FRAME_LEN};

/// Per-source queue depth. Producers that outrun the tick rate park on
/// `send` and get paced to real time.
const SOURCE_DEPTH: usize = 4;

pub struct Mixer {
    sources: Arc<Mutex<Vec<mpsc::Receiver<PcmFrame>>>>,
    out: Mutex<Option<mpsc::Sender<PcmFrame>>>,
    frame_len: usize,
    tick: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Mixer {
    /// Create an idle mixer writing merged frames to `out`.
    pub fn new(out: mpsc::Sender<PcmFrame>) -> Self {
        Self::with_timing(out, FRAME_LEN, FRAME_DURATION)
    }

    /// Frame-length and tick override, used by tests.
    pub fn with_timing(out: mpsc::Sender<PcmFrame>, frame_len: usize, tick: Duration) -> Self {
        Self {
            sources: Arc::new(Mutex::new(Vec::new())),
            out: Mutex::new(Some(out)),
            frame_len,
            tick,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Register a new source. The caller owns production and closes the
    /// source by dropping the sender; the mixer never closes one.
    pub fn create(&self) -> mpsc::Sender<PcmFrame> {
        let (tx, rx) = mpsc::channel(SOURCE_DEPTH);
        self.sources.lock().unwrap().push(rx);
        tx
    }

    /// Registered sources still alive at the last poll.
    pub fn source_count(&self) -> usize {
        self.sources.lock().unwrap().len()
    }

    /// Start the mixing loop. Runs until [`Mixer::stop`].
    pub fn start(&self) {
        let Some(out) = self.out.lock().unwrap().take() else {
            warn!("mixer already started");
            return;
        };
        let sources = Arc::clone(&self.sources);
        let cancel = self.cancel.clone();
        let frame_len = self.frame_len;
        let tick = self.tick;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Some(merged) = merge(&sources, frame_len) {
                    // stay cancellable even when the output queue is full
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = out.send(merged) => {
                            if sent.is_err() {
                                debug!("mixer output closed, stopping");
                                break;
                            }
                        }
                    }
                }
            }
            // `out` drops with the task: no writes can follow a stop
        });
        *self.task.lock().unwrap() = Some(task);
    }

    /// Stop the loop and wait until it has fully exited. After this returns
    /// no further frames are written to the output queue.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// One non-blocking poll across all sources. Closed sources are dropped;
/// same-tick contributions are saturating-summed sample by sample.
fn merge(sources: &Mutex<Vec<mpsc::Receiver<PcmFrame>>>, frame_len: usize) -> Option<PcmFrame> {
    let mut sources = sources.lock().unwrap();
    let mut merged: Option<PcmFrame> = None;

    sources.retain_mut(|rx| match rx.try_recv() {
        Ok(frame) => {
            if frame.len() != frame_len {
                warn!(got = frame.len(), want = frame_len, "rejecting mis-sized mixer frame");
                return true;
            }
            match merged.as_mut() {
                None => merged = Some(frame),
                Some(acc) => {
                    for (sum, sample) in acc.iter_mut().zip(&frame) {
                        *sum = sum.saturating_add(*sample);
                    }
                }
            }
            true
        }
        Err(TryRecvError::Empty) => true,
        Err(TryRecvError::Disconnected) => false,
    });

    merged
}
