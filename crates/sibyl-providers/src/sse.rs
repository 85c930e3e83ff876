//! Minimal SSE parser for streaming completion responses.
//!
//! Converts a `reqwest::Response` body into a stream of `data:` payloads,
//! the only SSE field the completions endpoint uses.

use futures::{Stream, StreamExt};

struct SseState {
    byte_stream: std::pin::Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    current_data: Vec<String>,
}

/// Parse a reqwest response body as a stream of SSE data payloads.
pub fn parse_sse_data(response: reqwest::Response) -> impl Stream<Item = anyhow::Result<String>> {
    let byte_stream = response.bytes_stream();

    // partial lines accumulate across chunks
    futures::stream::unfold(
        SseState {
            byte_stream: Box::pin(byte_stream),
            buffer: String::new(),
            current_data: Vec::new(),
        },
        |mut state| async move {
            loop {
                // extract a complete line from the buffer if we have one
                if let Some(newline_pos) = state.buffer.find('\n') {
                    let line = state.buffer[..newline_pos].trim_end_matches('\r').to_string();
                    state.buffer = state.buffer[newline_pos + 1..].to_string();

                    if line.is_empty() {
                        // empty line dispatches the pending event
                        if !state.current_data.is_empty() {
                            let data = state.current_data.join("\n");
                            state.current_data.clear();
                            return Some((Ok(data), state));
                        }
                        continue;
                    }

                    if line.starts_with(':') {
                        continue; // comment
                    }

                    if let Some(value) = line.strip_prefix("data:") {
                        state.current_data.push(value.trim_start().to_string());
                    }
                    // other fields (event:, id:) are irrelevant here
                    continue;
                }

                match state.byte_stream.next().await {
                    Some(Ok(chunk)) => {
                        state.buffer.push_str(&String::from_utf8_lossy(&chunk));
                    }
                    Some(Err(e)) => {
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        // stream ended; flush any pending data
                        if !state.current_data.is_empty() {
                            let data = state.current_data.join("\n");
                            state.current_data.clear();
                            return Some((Ok(data), state));
                        }
                        return None;
                    }
                }
            }
        },
    )
}
