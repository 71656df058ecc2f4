//! Server-sent event framing for [`StreamEvent`]s.
//!
//! Each event becomes one `data: <json>\n\n` frame, in order. Long deltas are
//! split at codepoint boundaries into consecutive delta frames, and a comment
//! frame is written whenever the run stays quiet for the idle window.

use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::json;
use tracing::warn;

use relay_core::events::StreamEvent;

pub const KEEP_ALIVE: &str = ": keep-alive\n\n";

#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    /// Deltas longer than this many codepoints are split. `0` never splits.
    pub delta_chunk_chars: usize,
    /// Quiet time before a keep-alive frame. Zero disables keep-alives.
    pub idle_keepalive: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            delta_chunk_chars: 64,
            idle_keepalive: Duration::from_secs(15),
        }
    }
}

/// One wire frame.
pub fn frame(event: &StreamEvent) -> String {
    let payload = match event {
        StreamEvent::Ready => json!({ "ready": true }),
        StreamEvent::Delta(text) => json!({ "delta": text }),
        StreamEvent::UsageError(message) => json!({ "usage_error": message }),
        StreamEvent::Done => json!({ "done": true }),
    };
    format!("data: {payload}\n\n")
}

/// Split `text` into pieces of at most `max_chars` codepoints.
pub fn split_delta(text: &str, max_chars: usize) -> Vec<&str> {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return vec![text];
    }
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in text.char_indices() {
        if count == max_chars {
            pieces.push(&text[start..idx]);
            start = idx;
            count = 0;
        }
        count += 1;
    }
    pieces.push(&text[start..]);
    pieces
}

fn frames(event: &StreamEvent, max_chars: usize) -> Vec<String> {
    match event {
        StreamEvent::Delta(text) => split_delta(text, max_chars)
            .into_iter()
            .map(|piece| frame(&StreamEvent::Delta(piece.to_string())))
            .collect(),
        other => vec![frame(other)],
    }
}

/// Encode a run's events into wire bytes.
///
/// The byte stream ends right after the `done` frame. If the events end
/// without one, a `done` frame is still written.
pub fn encode<S>(events: S, config: TransportConfig) -> impl Stream<Item = Bytes> + Send
where
    S: Stream<Item = StreamEvent> + Send + Unpin + 'static,
{
    async_stream::stream! {
        let mut events = events;
        loop {
            let next = if config.idle_keepalive.is_zero() {
                events.next().await
            } else {
                match tokio::time::timeout(config.idle_keepalive, events.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        yield Bytes::from_static(KEEP_ALIVE.as_bytes());
                        continue;
                    }
                }
            };
            let Some(event) = next else {
                warn!("event stream ended without done");
                yield Bytes::from(frame(&StreamEvent::Done));
                break;
            };
            for piece in frames(&event, config.delta_chunk_chars) {
                yield Bytes::from(piece);
            }
            if event.is_terminal() {
                break;
            }
        }
    }
}
