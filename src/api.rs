use crate::models::ChatMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

// Alias for the stream type we'll return
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(180);

// Trait defining the interface to the LLM server
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// True when the server answers the model listing with a success status.
    async fn check_connection(&self, base_url: &str) -> bool;

    async fn fetch_models(&self, base_url: &str) -> Result<Vec<String>>;

    // Returns a stream of content deltas.
    async fn stream_chat(
        &self,
        base_url: &str,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<DeltaStream>;
}

// --- Ollama Implementation ---

#[derive(Serialize, Debug)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool, // Always true
}

// One line of the streamed /api/chat response
#[derive(Deserialize, Debug)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaModelTag>,
}

#[derive(Deserialize, Debug)]
struct OllamaModelTag {
    name: String,
}

pub struct OllamaClient {
    client: Client,
}

impl OllamaClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &str, path: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl ChatBackend for OllamaClient {
    async fn check_connection(&self, base_url: &str) -> bool {
        let url = Self::endpoint(base_url, "/api/tags");
        match self.client.get(&url).send().await {
            Ok(response) => {
                let ok = response.status().is_success();
                log::debug!("Connection check against {} returned {}", url, response.status());
                ok
            }
            Err(e) => {
                log::error!("Connection check against {} failed: {}", url, e);
                false
            }
        }
    }

    async fn fetch_models(&self, base_url: &str) -> Result<Vec<String>> {
        let url = Self::endpoint(base_url, "/api/tags");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to request model list")?;

        if !response.status().is_success() {
            log::warn!("Model list request returned status {}", response.status());
            return Ok(Vec::new());
        }

        let body = response.text().await.context("Failed to read model list body")?;
        log::debug!("Model list response: {}", body);
        let tags: OllamaTags =
            serde_json::from_str(&body).context("Failed to parse model list JSON")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn stream_chat(
        &self,
        base_url: &str,
        model: &str,
        messages: &[ChatMessage],
    ) -> Result<DeltaStream> {
        let url = Self::endpoint(base_url, "/api/chat");
        log::info!("Sending STREAM request to {} using model: {}", url, model);

        let request_body = OllamaChatRequest {
            model,
            messages,
            stream: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .context("Failed to send chat request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "<Failed to read error body>".to_string());
            log::error!("Chat request failed with status {}: {}", status, error_body);
            return Err(anyhow::anyhow!("HTTP {}: {}", status.as_u16(), error_body));
        }

        Ok(ndjson_deltas(response.bytes_stream()))
    }
}

/// What a single response line means for the stream.
#[derive(Debug, PartialEq)]
pub enum LineOutcome {
    /// Text to hand to the caller; `done` ends the stream afterwards.
    Content { text: Option<String>, done: bool },
    /// Blank or unparseable line.
    Skip,
    /// The server reported an error in-band.
    Error(String),
}

pub fn decode_line(line: &str) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Skip;
    }

    match serde_json::from_str::<OllamaChatChunk>(line) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return LineOutcome::Error(error);
            }
            let text = chunk
                .message
                .and_then(|m| m.content)
                .filter(|content| !content.is_empty());
            LineOutcome::Content { text, done: chunk.done }
        }
        Err(e) => {
            log::warn!("Skipping malformed stream line ({}): {}", e, line);
            LineOutcome::Skip
        }
    }
}

struct NdjsonState<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> NdjsonState<S> {
    // Decodes one line; returns false once the stream must end.
    fn push_line(&mut self, raw: &[u8]) -> bool {
        let line = String::from_utf8_lossy(raw);
        match decode_line(&line) {
            LineOutcome::Skip => true,
            LineOutcome::Content { text, done } => {
                if let Some(text) = text {
                    self.pending.push_back(Ok(text));
                }
                if done {
                    log::info!("Stream finished with done flag");
                }
                !done
            }
            LineOutcome::Error(error) => {
                log::error!("Server reported an error mid-stream: {}", error);
                self.pending.push_back(Err(anyhow::anyhow!(error)));
                false
            }
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if !self.push_line(&line) {
                self.finish();
                return;
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.buffer.clear();
    }
}

/// Turns a newline-delimited JSON chat response body into a stream of text fragments.
pub fn ndjson_deltas<S, B, E>(body: S) -> DeltaStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let state = NdjsonState {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    let deltas = stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(chunk.as_ref());
                    state.drain_complete_lines();
                }
                Some(Err(e)) => {
                    log::error!("Error reading response stream: {}", e);
                    state
                        .pending
                        .push_back(Err(anyhow::Error::new(e).context("Error reading response stream")));
                    state.finish();
                }
                None => {
                    // Connection closed; decode whatever is left without a trailing newline
                    let rest = std::mem::take(&mut state.buffer);
                    state.push_line(&rest);
                    state.finish();
                }
            }
        }
    });

    Box::pin(deltas)
}
