use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Future, Stream};
use serde_json::Value;

use relay_core::errors::GatewayError;
use relay_core::stream::RawEvent;

/// One server-sent event: the optional `event:` name and its joined `data:` lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Parse raw SSE text into frames. Comment lines (`:`) are skipped and
/// multi-line data is joined with `\n`. A trailing frame without the blank
/// terminator is still returned.
pub fn parse_sse_lines(raw: &str) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    let mut event: Option<String> = None;
    let mut data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.is_empty() {
            flush_frame(&mut frames, &mut event, &mut data);
        } else if line.starts_with(':') {
            continue;
        } else if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim_start().to_string());
        } else if let Some(payload) = line.strip_prefix("data:") {
            data.push(payload.strip_prefix(' ').unwrap_or(payload));
        }
    }
    flush_frame(&mut frames, &mut event, &mut data);

    frames
}

fn flush_frame(frames: &mut Vec<SseFrame>, event: &mut Option<String>, data: &mut Vec<&str>) {
    if event.is_none() && data.is_empty() {
        return;
    }
    frames.push(SseFrame {
        event: event.take(),
        data: data.join("\n"),
    });
    data.clear();
}

/// Maps Responses API stream events onto the collaborator alphabet.
#[derive(Default)]
pub struct ResponsesParser {
    completed: Option<Value>,
}

impl ResponsesParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// The response payload delivered with `response.completed`, if seen.
    pub fn completed_response(&self) -> Option<&Value> {
        self.completed.as_ref()
    }

    /// The event type comes from the payload's `type`, falling back to the
    /// SSE event name. Unparseable payloads are reported as `Other`.
    pub fn parse_frame(&mut self, frame: &SseFrame) -> Option<Result<RawEvent, GatewayError>> {
        if frame.data.trim() == "[DONE]" {
            return None;
        }
        let payload: Value = serde_json::from_str(&frame.data).unwrap_or(Value::Null);
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| frame.event.clone())?;

        let event = match kind.as_str() {
            "response.output_text.delta" => {
                let delta = payload.get("delta").and_then(Value::as_str).unwrap_or_default();
                Ok(RawEvent::text(delta))
            }
            "response.completed" => {
                let response = payload.get("response").cloned();
                self.completed.clone_from(&response);
                Ok(RawEvent::Completed { response })
            }
            "response.failed" | "response.incomplete" => {
                let message = payload
                    .pointer("/response/error/message")
                    .or_else(|| payload.pointer("/response/incomplete_details/reason"))
                    .and_then(Value::as_str)
                    .unwrap_or(kind.as_str());
                Err(GatewayError::ResponseFailed(message.to_string()))
            }
            "error" => Err(classify_error(&payload)),
            _ => Ok(RawEvent::other(kind)),
        };
        Some(event)
    }
}

fn classify_error(payload: &Value) -> GatewayError {
    let error = payload.get("error").unwrap_or(payload);
    let code = error.get("code").and_then(Value::as_str).unwrap_or_default();
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("stream error")
        .to_string();
    match code {
        "rate_limit_exceeded" => GatewayError::RateLimited { retry_after: None },
        "invalid_api_key" => GatewayError::AuthenticationFailed(message),
        "invalid_request_error" | "context_length_exceeded" => GatewayError::InvalidRequest(message),
        "server_error" => GatewayError::ServerError { status: 500, body: message },
        _ => GatewayError::StreamInterrupted(message),
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

/// Wraps a response body and yields parsed events.
/// Includes an idle timeout: if no data arrives within `idle_duration`, yields
/// an error and ends.
pub struct SseStream {
    inner: ByteStream,
    parser: ResponsesParser,
    buffer: Vec<u8>,
    pending: std::collections::VecDeque<Result<RawEvent, GatewayError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    pub fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            parser: ResponsesParser::new(),
            buffer: Vec::new(),
            pending: std::collections::VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    pub fn completed_response(&self) -> Option<&Value> {
        self.parser.completed_response()
    }

    /// Frames are cut on raw bytes so a codepoint split across two network
    /// chunks is decoded only once it is whole.
    fn drain_complete_frames(&mut self) {
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let chunk: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.parse_chunk(&String::from_utf8_lossy(&chunk));
        }
    }

    fn parse_chunk(&mut self, chunk: &str) {
        for frame in parse_sse_lines(chunk) {
            if let Some(event) = self.parser.parse_frame(&frame) {
                self.pending.push_back(event);
            }
        }
    }
}

impl Stream for SseStream {
    type Item = Result<RawEvent, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.pending.pop_front() {
            return Poll::Ready(Some(event));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    self.buffer.extend(bytes.iter().filter(|b| **b != b'\r'));
                    self.drain_complete_frames();

                    if let Some(event) = self.pending.pop_front() {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    let remaining = std::mem::take(&mut self.buffer);
                    let remaining = String::from_utf8_lossy(&remaining);
                    if !remaining.trim().is_empty() {
                        self.parse_chunk(&remaining);
                    }
                    return Poll::Ready(self.pending.pop_front());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
