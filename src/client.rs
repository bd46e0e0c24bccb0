use anyhow::Result;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, Client};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio::time::timeout;

use crate::config::{EndpointKind, TransportBudget};
use crate::failure::FailureKind;
use crate::stream::LineSource;

// Request types for the OpenAI Chat Completions API
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f64,
    pub max_completion_tokens: u32,
    pub stream: bool,
    pub stream_options: StreamOptions,
}

// Request types for the legacy Completions API
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub stream: bool,
    pub stream_options: StreamOptions,
}

/// Role attached to the single prompt message of a chat request.
pub const CHAT_ROLE: &str = "user932232";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// Body of one streaming completion request.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestPayload {
    Chat(ChatCompletionRequest),
    Generate(CompletionRequest),
}

/// Builds a streaming request that asks for usage in the final event.
pub fn build_payload(
    kind: EndpointKind,
    model: &str,
    prompt: &str,
    temperature: f64,
    max_tokens: u32,
) -> RequestPayload {
    let stream_options = StreamOptions {
        include_usage: true,
    };

    match kind {
        EndpointKind::Chat => RequestPayload::Chat(ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![Message {
                role: CHAT_ROLE.to_string(),
                content: prompt.to_string(),
            }],
            temperature,
            max_completion_tokens: max_tokens,
            stream: true,
            stream_options,
        }),
        EndpointKind::Generate => RequestPayload::Generate(CompletionRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            max_tokens,
            temperature,
            stream: true,
            stream_options,
        }),
    }
}

// Models list response
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub owned_by: String,
}

/// Configuration for creating a streaming client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Full URL of the completion endpoint
    pub url: String,
    /// Optional API key for authentication
    pub api_key: Option<String>,
    /// Connect/write/pool budgets and the number of transport slots
    pub budget: TransportBudget,
}

/// HTTP client shared by every executor of a run.
///
/// Connections come from one pool. A request first waits for one of
/// `pool_size` transport slots, then sends, then streams; each phase has its
/// own budget and its own failure kind.
#[derive(Debug, Clone)]
pub struct StreamingClient {
    client: Client,
    url: String,
    api_key: Option<String>,
    slots: Arc<Semaphore>,
    budget: TransportBudget,
}

impl StreamingClient {
    /// Creates a new client with connection pooling sized to the slot count.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use stream_bench::client::{ClientConfig, StreamingClient};
    /// use stream_bench::config::TransportBudget;
    /// use std::time::Duration;
    ///
    /// let client = StreamingClient::new(ClientConfig {
    ///     url: "http://localhost:8000/v1/chat/completions".to_string(),
    ///     api_key: None,
    ///     budget: TransportBudget {
    ///         connect: Duration::from_secs(10),
    ///         write: Duration::from_secs(60),
    ///         pool: Duration::from_secs(10),
    ///         pool_size: 16,
    ///     },
    /// })
    /// .unwrap();
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.budget.connect)
            .pool_max_idle_per_host(config.budget.pool_size) // Match concurrency for connection reuse
            .pool_idle_timeout(Duration::from_secs(300))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            client,
            url: config.url,
            api_key: config.api_key,
            slots: Arc::new(Semaphore::new(config.budget.pool_size)),
            budget: config.budget,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sends one streaming request and returns its body as lines.
    ///
    /// The transport slot is held until the returned [`SseLines`] is dropped.
    pub async fn stream(&self, payload: &RequestPayload) -> Result<SseLines, FailureKind> {
        let permit = match timeout(self.budget.pool, Arc::clone(&self.slots).acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(FailureKind::Other("transport pool closed".to_string())),
            Err(_) => return Err(FailureKind::PoolExhausted),
        };

        let bytes = serde_json::to_vec(payload)
            .map_err(|e| FailureKind::Other(format!("Failed to encode request: {}", e)))?;
        let length = bytes.len();
        let (body, written) = tracked_body(bytes);

        let mut req = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, length)
            .header("Connection", "keep-alive")
            .body(body);

        if let Some(api_key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", api_key));
        }

        // The write budget ends once the body is handed to the connection.
        // Waiting for the response head is bounded only by the caller's
        // overall deadline.
        let send = req.send();
        tokio::pin!(send);
        let written = timeout(self.budget.write, written);
        tokio::pin!(written);

        let sent = tokio::select! {
            biased;
            result = &mut send => Some(result),
            written = &mut written => {
                if written.is_err() {
                    return Err(FailureKind::WriteTimeout);
                }
                None
            }
        };
        let sent = match sent {
            Some(result) => result,
            None => send.await,
        };
        let response = sent.map_err(|e| FailureKind::from_send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(FailureKind::from_status(status.as_u16(), &body));
        }

        Ok(SseLines {
            response,
            lines: LineBuffer::default(),
            closed: false,
            _slot: permit,
        })
    }
}

/// Wraps an encoded request as a one-chunk streaming body.
///
/// The receiver resolves when the transport takes the chunk, or errors if
/// the body is dropped unsent. Either way the write phase is over.
fn tracked_body(bytes: Vec<u8>) -> (Body, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let mut pending = Some((bytes, tx));
    let chunks = futures_util::stream::poll_fn(move |_| {
        Poll::Ready(pending.take().map(|(bytes, tx)| {
            let _ = tx.send(());
            Ok::<_, std::io::Error>(bytes)
        }))
    });
    (Body::wrap_stream(chunks), rx)
}

/// Splits a byte stream into text lines, tolerating chunk boundaries that
/// fall inside a line or inside a multi-byte character.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
    ready: VecDeque<String>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            self.ready.push_back(decode_line(&line));
        }
    }

    /// Flushes an unterminated last line.
    pub fn finish(&mut self) {
        if !self.partial.is_empty() {
            let rest = std::mem::take(&mut self.partial);
            self.ready.push_back(decode_line(&rest));
        }
    }

    pub fn pop(&mut self) -> Option<String> {
        self.ready.pop_front()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.trim_end_matches(['\n', '\r']).to_string()
}

/// Body of a successful streaming response.
pub struct SseLines {
    response: reqwest::Response,
    lines: LineBuffer,
    closed: bool,
    _slot: OwnedSemaphorePermit,
}

impl LineSource for SseLines {
    async fn next_line(&mut self) -> Result<Option<String>, FailureKind> {
        loop {
            if let Some(line) = self.lines.pop() {
                return Ok(Some(line));
            }

            if self.closed {
                return Ok(None);
            }

            match self.response.chunk().await {
                Ok(Some(bytes)) => self.lines.push(&bytes),
                Ok(None) => {
                    self.closed = true;
                    self.lines.finish();
                }
                Err(e) => return Err(FailureKind::from_read_error(&e)),
            }
        }
    }
}

// Helper function to list available models
pub async fn list_models(
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<Vec<Model>> {
    let client = Client::builder().timeout(timeout).build()?;

    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let mut req = client.get(&url);

    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }

    let response = req
        .send()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to query models endpoint: {}", e))?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());
        anyhow::bail!("Models endpoint returned {}: {}", status, text);
    }

    let models_response: ModelsResponse = response
        .json()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to parse models response: {}", e))?;

    Ok(models_response.data)
}

// Helper function to detect model from server
pub async fn detect_model(
    base_url: &str,
    api_key: Option<&str>,
    timeout: Duration,
) -> Result<String> {
    let models = list_models(base_url, api_key, timeout).await?;

    let Some(first) = models.first() else {
        anyhow::bail!("No models available from server at {}/v1/models", base_url);
    };

    if models.len() > 1 {
        log::info!("Found {} models, using: {}", models.len(), first.id);
        log::debug!(
            "Available models: {:?}",
            models.iter().map(|m| &m.id).collect::<Vec<_>>()
        );
    } else {
        log::info!("Detected model: {}", first.id);
    }

    Ok(first.id.clone())
}
