//! Chat model client
//!
//! Talks to any `OpenAI`-compatible `/chat/completions` endpoint and exposes
//! the reply as a stream of text deltas parsed from server-sent events.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::Value;

use crate::config::LlmConfig;
use crate::{Error, Result};

/// Stream of text deltas from the model
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversation turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A language model that can stream a reply
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Start a streamed completion over `messages`
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be started
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<TokenStream>;

    /// Run a completion to the end and return the full text
    ///
    /// # Errors
    ///
    /// Returns error if the request or the stream fails
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let mut stream = self.stream_chat(messages).await?;
        let mut text = String::new();
        while let Some(token) = stream.next().await {
            text.push_str(&token?);
        }
        Ok(text)
    }
}

/// `OpenAI`-compatible chat completions client
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiChat {
    /// Create a new client
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(api_key: &str, config: &LlmConfig) -> Result<Self> {
        if api_key.is_empty() {
            return Err(Error::Config("OpenAI API key required for chat".to_string()));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: SecretString::from(api_key.to_string()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        #[derive(Serialize)]
        struct ChatRequest<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            stream: bool,
            max_tokens: u32,
            temperature: f32,
        }

        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        tracing::debug!(model = %self.model, messages = messages.len(), "starting chat stream");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "chat request failed");
                e
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Llm(format!("chat API error {status}: {body}")));
        }

        Ok(sse_token_stream(Box::pin(response.bytes_stream())))
    }
}

struct SseState<S> {
    bytes: S,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

/// Turn a byte stream of SSE frames into a stream of text deltas
pub fn sse_token_stream<S, B, E>(bytes: S) -> TokenStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = SseState {
        bytes,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(token) = state.pending.pop_front() {
                return Some((Ok(token), state));
            }
            if state.done {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    // Split on raw bytes so multi-byte characters survive chunk boundaries
                    state.buffer.extend_from_slice(chunk.as_ref());
                    while let Some(pos) = state.buffer.iter().position(|&b| b == b'\n') {
                        let line = String::from_utf8_lossy(&state.buffer[..pos]).trim().to_string();
                        state.buffer.drain(..=pos);

                        let Some(data) = line.strip_prefix("data:") else {
                            continue;
                        };
                        match parse_sse_data(data.trim()) {
                            SseEvent::Delta(text) => state.pending.push_back(text),
                            SseEvent::Done => {
                                state.done = true;
                                break;
                            }
                            SseEvent::Skip => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(Error::Llm(format!("stream error: {e}"))), state));
                }
                None => state.done = true,
            }
        }
    })
    .boxed()
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Delta(String),
    Done,
    Skip,
}

/// Parse the payload of one `data:` line
fn parse_sse_data(data: &str) -> SseEvent {
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    let Ok(v) = serde_json::from_str::<Value>(data) else {
        tracing::warn!(data, "unparseable stream chunk");
        return SseEvent::Skip;
    };

    v["choices"]
        .get(0)
        .and_then(|choice| choice["delta"]["content"].as_str())
        .filter(|s| !s.is_empty())
        .map_or(SseEvent::Skip, |s| SseEvent::Delta(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&str]) -> TokenStream {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        sse_token_stream(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_parses_deltas_across_chunk_boundaries() {
        let stream = frames(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hej\"}}]}\n\ndata: {\"choi",
            "ces\":[{\"delta\":{\"content\":\" Leon!\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        ]);
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["Hej", " Leon!"]);
    }

    #[tokio::test]
    async fn test_multibyte_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"hälsade\"}}]}\n".as_bytes();
        let split = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> =
            vec![Ok(line[..split].to_vec()), Ok(line[split..].to_vec())];
        let tokens: Vec<String> = sse_token_stream(stream::iter(chunks))
            .map(|t| t.unwrap())
            .collect()
            .await;
        assert_eq!(tokens, vec!["hälsade"]);
    }

    #[tokio::test]
    async fn test_stops_at_done() {
        let stream = frames(&[
            "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
            "data: [DONE]\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        ]);
        let tokens: Vec<String> = stream.map(|t| t.unwrap()).collect().await;
        assert_eq!(tokens, vec!["a"]);
    }

    #[tokio::test]
    async fn test_transport_error_surfaces() {
        let chunks: Vec<std::result::Result<Vec<u8>, std::io::Error>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n".to_vec()),
            Err(std::io::Error::other("reset")),
        ];
        let results: Vec<Result<String>> = sse_token_stream(stream::iter(chunks)).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[1].is_err());
    }

    #[test]
    fn test_parse_sse_data() {
        assert_eq!(parse_sse_data("[DONE]"), SseEvent::Done);
        assert_eq!(parse_sse_data("not json"), SseEvent::Skip);
        assert_eq!(parse_sse_data("{\"choices\":[]}"), SseEvent::Skip);
    }

    #[test]
    fn test_roles_serialize_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("hej")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"hej"}"#);
    }
}
