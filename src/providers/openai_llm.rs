//! OpenAI-compatible chat completions client with SSE streaming.

use super::sse::SseParser;
use super::{
    ChatMessage, FragmentStream, LanguageModelClient, QueryOptions, classify_status,
    classify_transport, error_message, http_client, retry_transient_once,
};
use crate::config::{LlmConfig, Secret};
use crate::error::{ErrorRecord, Result, Stage, StageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Streams `choices[0].delta.content` from `/v1/chat/completions`.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Secret,
    model: String,
}

impl std::fmt::Debug for OpenAiChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAiChatClient {
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be built.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(config.connect_timeout_secs), None)?,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn send(&self, body: &serde_json::Value) -> StageResult<reqwest::Response> {
        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(self.api_key.expose());
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(Stage::LanguageModel, &e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(
                Stage::LanguageModel,
                status.as_u16(),
                &error_message(&text),
            ));
        }
        Ok(response)
    }
}

/// Request body for a streamed chat completion.
pub fn build_request(
    model: &str,
    system_prompt: &str,
    history: &[ChatMessage],
    options: &QueryOptions,
) -> serde_json::Value {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.is_empty() {
        messages.push(serde_json::json!({"role": "system", "content": system_prompt}));
    }
    messages.extend(
        history
            .iter()
            .map(|m| serde_json::json!({"role": m.role.as_str(), "content": m.content})),
    );
    serde_json::json!({
        "model": model,
        "messages": messages,
        "stream": true,
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
    })
}

/// Text delta from one streamed chunk, if any.
pub fn parse_delta(data: &str) -> StageResult<Option<String>> {
    let value: serde_json::Value = serde_json::from_str(data).map_err(|e| {
        ErrorRecord::recoverable(Stage::LanguageModel, format!("bad stream chunk: {e}"))
    })?;
    if let Some(err) = value.get("error") {
        let msg = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("provider error");
        return Err(ErrorRecord::transient(Stage::LanguageModel, msg));
    }
    Ok(value
        .pointer("/choices/0/delta/content")
        .and_then(|c| c.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned))
}

struct StreamState {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    parser: SseParser,
    ready: VecDeque<StageResult<String>>,
    done: bool,
}

impl StreamState {
    fn absorb(&mut self, events: impl IntoIterator<Item = super::sse::SseEvent>) {
        for event in events {
            if event.is_done() {
                self.done = true;
                break;
            }
            match parse_delta(&event.data) {
                Ok(Some(text)) => self.ready.push_back(Ok(text)),
                Ok(None) => {}
                Err(e) => {
                    self.ready.push_back(Err(e));
                    self.done = true;
                    break;
                }
            }
        }
    }
}

fn fragment_stream(
    body: impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> FragmentStream {
    let state = StreamState {
        body: Box::pin(body),
        parser: SseParser::new(),
        ready: VecDeque::new(),
        done: false,
    };
    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.ready.pop_front() {
                return Some((item, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.parser.push(&chunk);
                    state.absorb(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    let err = ErrorRecord::transient(
                        Stage::LanguageModel,
                        format!("stream dropped: {e}"),
                    );
                    return Some((Err(err), state));
                }
                None => {
                    let tail = state.parser.finish();
                    state.absorb(tail);
                    state.done = true;
                }
            }
        }
    }))
}

#[async_trait]
impl LanguageModelClient for OpenAiChatClient {
    async fn query(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        options: &QueryOptions,
    ) -> StageResult<FragmentStream> {
        let body = build_request(&self.model, system_prompt, history, options);
        tracing::debug!(model = %self.model, messages = history.len(), "chat completion request");
        let response = retry_transient_once(RETRY_BACKOFF, || self.send(&body)).await?;
        Ok(fragment_stream(response.bytes_stream()))
    }
}
