//! HTTP client for OpenAI-compatible chat endpoints (vLLM, remote gateways)

use super::{ChatMessage, ChatModel, ChatOptions, ChatStream, StreamDelta};
use crate::config::LlmEndpoint;
use crate::error::{GatehouseError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::time::Duration;

/// OpenAI-compatible chat client for a single endpoint.
pub struct OpenAiChatClient {
    http_client: reqwest::Client,
    endpoint: LlmEndpoint,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_thinking: Option<bool>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: DeltaPayload,
}

#[derive(Deserialize, Default)]
struct DeltaPayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl OpenAiChatClient {
    pub fn new(endpoint: LlmEndpoint, timeout_secs: u64, max_retries: u32) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(GatehouseError::Http)?;
        Ok(Self {
            http_client,
            endpoint,
            max_retries,
        })
    }

    fn request(&self, body: &ChatRequest<'_>) -> reqwest::RequestBuilder {
        let url = format!("{}/chat/completions", self.endpoint.api_base_url);
        let mut req = self.http_client.post(&url).json(body);
        if let Some(token) = self
            .endpoint
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
        {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        req
    }

    async fn send_once(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response> {
        let response = self.request(body).send().await.map_err(GatehouseError::Http)?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(GatehouseError::Llm(format!(
                "LLM service error (HTTP {status}): {text}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OpenAiChatClient {
    async fn complete(&self, messages: Vec<ChatMessage>, opts: &ChatOptions) -> Result<String> {
        let body = ChatRequest {
            model: &self.endpoint.llm_model_name,
            messages: &messages,
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            stream: false,
            enable_thinking: opts.enable_thinking.then_some(true),
        };

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
            match self.send_once(&body).await {
                Ok(response) => {
                    let parsed: ChatResponse =
                        response.json().await.map_err(GatehouseError::Http)?;
                    return parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .ok_or_else(|| GatehouseError::Llm("no choices in response".to_string()));
                }
                Err(e) => {
                    tracing::warn!(
                        model = %self.endpoint.llm_model_name,
                        attempt,
                        "chat completion failed: {e}"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatehouseError::Llm("chat completion failed".to_string())))
    }

    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        opts: &ChatOptions,
    ) -> Result<ChatStream> {
        let body = ChatRequest {
            model: &self.endpoint.llm_model_name,
            messages: &messages,
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
            stream: true,
            enable_thinking: opts.enable_thinking.then_some(true),
        };

        let response = self.send_once(&body).await?;

        struct SseState {
            body: Pin<Box<dyn futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
            buffer: String,
            pending: std::collections::VecDeque<StreamDelta>,
            done: bool,
        }

        let state = SseState {
            body: Box::pin(response.bytes_stream()),
            buffer: String::new(),
            pending: std::collections::VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(delta) = st.pending.pop_front() {
                    return Some((Ok(delta), st));
                }
                if st.done {
                    return None;
                }
                match st.body.next().await {
                    None => {
                        st.done = true;
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((
                            Err(GatehouseError::Llm(format!("stream read error: {e}"))),
                            st,
                        ));
                    }
                    Some(Ok(bytes)) => {
                        st.buffer.push_str(&String::from_utf8_lossy(&bytes));
                        while let Some(pos) = st.buffer.find('\n') {
                            let line = st.buffer[..pos].trim().to_string();
                            st.buffer.drain(..=pos);
                            let Some(data) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let data = data.trim();
                            if data == "[DONE]" {
                                st.done = true;
                                break;
                            }
                            match serde_json::from_str::<StreamChunk>(data) {
                                Ok(chunk) => {
                                    for choice in chunk.choices {
                                        let delta = StreamDelta {
                                            content: choice.delta.content,
                                            reasoning: choice.delta.reasoning_content,
                                        };
                                        if delta.content.is_some() || delta.reasoning.is_some() {
                                            st.pending.push_back(delta);
                                        }
                                    }
                                }
                                Err(e) => {
                                    tracing::debug!("skipping unparseable SSE chunk: {e}");
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }

    fn model_name(&self) -> &str {
        &self.endpoint.llm_model_name
    }
}
