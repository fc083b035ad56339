//! Model backend seam.
//!
//! The gateway is the only component that holds a model credential. It talks
//! to the backend through [`ModelBackend`]; [`HttpModelBackend`] speaks a
//! Messages-style JSON API with server-sent-event streaming.

use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Result, SandboxError};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const STREAM_BUFFER: usize = 32;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Free-form context forwarded as the system prompt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    /// Output units reported by the backend, when it reports any.
    pub units_used: Option<u64>,
    pub model: String,
}

/// Incremental backend output.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    Content { text: String },
    ToolUse { name: String, input: Value },
    ToolResult { content: String },
    Usage { units: u64 },
    Error { message: String },
}

pub type BackendStream = BoxStream<'static, Result<BackendEvent>>;

#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Open a streaming completion. The stream ends after the final event.
    async fn stream(&self, request: &ModelRequest) -> Result<BackendStream>;
}

pub struct HttpModelBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpModelBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(SandboxError::Validation("model API key is not configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SandboxError::Backend(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn body(request: &ModelRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [{ "role": "user", "content": request.prompt }],
            "stream": stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(context) = &request.context {
            body["system"] = json!(context);
        }
        body
    }

    async fn send(&self, request: &ModelRequest, stream: bool) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&Self::body(request, stream))
            .send()
            .await
            .map_err(|e| SandboxError::Backend(format!("model request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!(
                "model API returned {status}: {}",
                crate::util::truncate_chars(&text, 500)
            )));
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl ModelBackend for HttpModelBackend {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let body: Value = self
            .send(request, false)
            .await?
            .json()
            .await
            .map_err(|e| SandboxError::Backend(format!("invalid model response: {e}")))?;
        let text = body
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<String>()
            })
            .ok_or_else(|| SandboxError::Backend("model response has no content".into()))?;
        Ok(ModelResponse {
            text,
            units_used: body.pointer("/usage/output_tokens").and_then(Value::as_u64),
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&request.model)
                .to_string(),
        })
    }

    async fn stream(&self, request: &ModelRequest) -> Result<BackendStream> {
        let response = self.send(request, true).await?;
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(SandboxError::Backend(format!("stream read failed: {e}"))))
                            .await;
                        return;
                    }
                };
                for event in decoder.push_bytes(&chunk) {
                    if tx.send(Ok(event)).await.is_err() {
                        // Receiver dropped; stop reading.
                        return;
                    }
                }
                if decoder.finished {
                    return;
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }
}

/// Incremental decoder for Messages-API server-sent events.
///
/// Input is buffered as raw bytes and a frame is only decoded as UTF-8 once
/// its terminating blank line has arrived.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    tool: Option<(String, String)>,
    pub finished: bool,
}

impl SseDecoder {
    pub fn push(&mut self, text: &str) -> Vec<BackendEvent> {
        self.push_bytes(text.as_bytes())
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<BackendEvent> {
        // CR never occurs inside a multi-byte sequence.
        self.buffer
            .extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(idx) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..idx + 2).collect();
            let frame = String::from_utf8_lossy(&raw);
            let data: String = frame
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect::<Vec<_>>()
                .join("\n");
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            match serde_json::from_str::<Value>(&data) {
                Ok(payload) => events.extend(self.handle(&payload)),
                Err(e) => tracing::debug!(error = %e, "skipping undecodable SSE frame"),
            }
        }
        events
    }

    fn handle(&mut self, payload: &Value) -> Option<BackendEvent> {
        let kind = payload.get("type").and_then(Value::as_str)?;
        match kind {
            "content_block_start" => {
                let block = payload.get("content_block")?;
                match block.get("type").and_then(Value::as_str)? {
                    "tool_use" | "server_tool_use" => {
                        let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
                        self.tool = Some((name.to_string(), String::new()));
                        None
                    }
                    // `tool_result`, `web_search_tool_result` and friends
                    // arrive whole in the start event.
                    kind if kind.ends_with("tool_result") => Some(BackendEvent::ToolResult {
                        content: match block.get("content") {
                            Some(Value::String(text)) => text.clone(),
                            Some(other) => other.to_string(),
                            None => String::new(),
                        },
                    }),
                    _ => None,
                }
            }
            "content_block_delta" => {
                let delta = payload.get("delta")?;
                match delta.get("type").and_then(Value::as_str)? {
                    "text_delta" => Some(BackendEvent::Content {
                        text: delta.get("text").and_then(Value::as_str)?.to_string(),
                    }),
                    "input_json_delta" => {
                        if let (Some((_, input)), Some(part)) = (
                            self.tool.as_mut(),
                            delta.get("partial_json").and_then(Value::as_str),
                        ) {
                            input.push_str(part);
                        }
                        None
                    }
                    _ => None,
                }
            }
            "content_block_stop" => self.tool.take().map(|(name, input)| BackendEvent::ToolUse {
                name,
                input: serde_json::from_str(&input).unwrap_or(Value::Null),
            }),
            "message_delta" => payload
                .pointer("/usage/output_tokens")
                .and_then(Value::as_u64)
                .map(|units| BackendEvent::Usage { units }),
            "message_stop" => {
                self.finished = true;
                None
            }
            "error" => Some(BackendEvent::Error {
                message: payload
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown backend error")
                    .to_string(),
            }),
            _ => None,
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockBackend, MockReply};

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::StreamExt;
    use futures_util::stream;

    use super::*;

    /// One scripted backend answer.
    #[derive(Clone, Debug)]
    pub enum MockReply {
        Text { text: String, units: Option<u64> },
        Stream(Vec<BackendEvent>),
        /// Emit `events`, then fail the stream with `error`.
        StreamThenFail { events: Vec<BackendEvent>, error: String },
        Fail(String),
    }

    /// Scripted backend. Replies are consumed in order; the last one repeats.
    #[derive(Default)]
    pub struct MockBackend {
        replies: Mutex<VecDeque<MockReply>>,
        requests: Mutex<Vec<ModelRequest>>,
        pub calls: AtomicUsize,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_reply(self, reply: MockReply) -> Self {
            self.push_reply(reply);
            self
        }

        pub fn text(text: &str, units: u64) -> Self {
            Self::new().with_reply(MockReply::Text {
                text: text.to_string(),
                units: Some(units),
            })
        }

        pub fn push_reply(&self, reply: MockReply) {
            self.replies
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(reply);
        }

        pub fn requests(&self) -> Vec<ModelRequest> {
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
        }

        fn next_reply(&self, request: &ModelRequest) -> MockReply {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request.clone());
            let mut replies = self.replies.lock().unwrap_or_else(|e| e.into_inner());
            if replies.len() > 1 {
                replies.pop_front().unwrap_or(MockReply::Fail("no reply".into()))
            } else {
                replies
                    .front()
                    .cloned()
                    .unwrap_or(MockReply::Text {
                        text: "ok".into(),
                        units: None,
                    })
            }
        }
    }

    #[async_trait::async_trait]
    impl ModelBackend for MockBackend {
        async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
            let (text, units_used) = match self.next_reply(request) {
                MockReply::Text { text, units } => (text, units),
                MockReply::Stream(events) => {
                    let mut text = String::new();
                    let mut units = None;
                    for event in events {
                        match event {
                            BackendEvent::Content { text: t } => text.push_str(&t),
                            BackendEvent::Usage { units: u } => units = Some(u),
                            _ => {}
                        }
                    }
                    (text, units)
                }
                MockReply::StreamThenFail { error, .. } | MockReply::Fail(error) => {
                    return Err(SandboxError::Backend(error));
                }
            };
            Ok(ModelResponse {
                text,
                units_used,
                model: request.model.clone(),
            })
        }

        async fn stream(&self, request: &ModelRequest) -> Result<BackendStream> {
            let items: Vec<Result<BackendEvent>> = match self.next_reply(request) {
                MockReply::Text { text, units } => {
                    let mut items = vec![Ok(BackendEvent::Content { text })];
                    if let Some(units) = units {
                        items.push(Ok(BackendEvent::Usage { units }));
                    }
                    items
                }
                MockReply::Stream(events) => events.into_iter().map(Ok).collect(),
                MockReply::StreamThenFail { events, error } => events
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(SandboxError::Backend(error))))
                    .collect(),
                MockReply::Fail(error) => return Err(SandboxError::Backend(error)),
            };
            Ok(stream::iter(items).boxed())
        }
    }
}
