//! Staging pipes bridging a streaming producer and a single consumer.
//!
//! Writes never block and fail once the pipe is closed. Reads suspend the
//! consumer until data arrives or the pipe closes, draining everything
//! buffered before signaling end-of-stream. Closing an already-closed pipe
//! is an error.

use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipeError {
    #[error("pipe closed")]
    Closed,
}

#[derive(Default)]
struct ByteState {
    buf: VecDeque<u8>,
    closed: bool,
}

/// Byte-oriented pipe. Producers append without blocking; the single
/// consumer awaits data.
#[derive(Default)]
pub struct BytePipe {
    state: Mutex<ByteState>,
    readable: Notify,
}

impl BytePipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the buffer. Never blocks; fails after `close`.
    pub fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(PipeError::Closed);
            }
            state.buf.extend(data);
        }
        self.readable.notify_one();
        Ok(data.len())
    }

    /// Read up to `buf.len()` bytes, waiting until data is available.
    /// Returns `0` only once the pipe is closed and fully drained.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if !state.buf.is_empty() {
                    let n = buf.len().min(state.buf.len());
                    for (slot, byte) in buf.iter_mut().zip(state.buf.drain(..n)) {
                        *slot = byte;
                    }
                    return n;
                }
                if state.closed {
                    return 0;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Read everything until end-of-stream.
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = self.read(&mut chunk).await;
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Close the pipe. Subsequent writes fail; buffered data stays readable.
    pub fn close(&self) -> Result<(), PipeError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(PipeError::Closed);
            }
            state.closed = true;
        }
        self.readable.notify_one();
        Ok(())
    }
}

#[derive(Default)]
struct LineState {
    lines: VecDeque<String>,
    partial: String,
    closed: bool,
}

/// Line-delimited pipe. Text accumulates until a `\n` completes a line;
/// complete lines become readable in write order.
#[derive(Default)]
pub struct LinePipe {
    state: Mutex<LineState>,
    readable: Notify,
}

impl LinePipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text. Never blocks; fails after `close`.
    pub fn write(&self, text: &str) -> Result<usize, PipeError> {
        let mut promoted = false;
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(PipeError::Closed);
            }
            state.partial.push_str(text);
            while let Some(pos) = state.partial.find('\n') {
                let mut line: String = state.partial.drain(..=pos).collect();
                line.pop(); // strip the newline
                state.lines.push_back(line);
                promoted = true;
            }
        }
        if promoted {
            self.readable.notify_one();
        }
        Ok(text.len())
    }

    /// Next complete line, in write order. `None` once the pipe is closed
    /// and drained.
    pub async fn read_line(&self) -> Option<String> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some(line) = state.lines.pop_front() {
                    return Some(line);
                }
                if state.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Close the pipe, flushing any unterminated trailing text as a final
    /// line.
    pub fn close(&self) -> Result<(), PipeError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(PipeError::Closed);
            }
            if !state.partial.is_empty() {
                let rest = std::mem::take(&mut state.partial);
                state.lines.push_back(rest);
            }
            state.closed = true;
        }
        self.readable.notify_one();
        Ok(())
    }
}
