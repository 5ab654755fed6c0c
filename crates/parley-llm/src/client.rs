use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Future, Stream};
use parley_core::{GenerationError, OnFragment};
use parley_settings::LlmSettings;
use rand::Rng;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{instrument, warn};

use crate::errors::LlmError;
use crate::sse::{self, SseEvent};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Stream of text deltas. Ends after the first error.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub api_url: String,
    pub max_tokens: u32,
    pub idle_timeout: Duration,
    /// Retries for retryable failures before any text has streamed.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: LlmSettings::default().api_url,
            max_tokens: 1024,
            idle_timeout: SSE_IDLE_TIMEOUT,
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

impl From<&LlmSettings> for ClientConfig {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            api_url: settings.api_url.clone(),
            max_tokens: settings.max_tokens,
            ..Self::default()
        }
    }
}

/// One single-turn completion request.
#[derive(Clone, Debug)]
pub struct CompletionRequest {
    pub model: String,
    pub system: Option<String>,
    pub prompt: String,
}

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: [RequestMessage<'a>; 1],
}

#[derive(Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

/// Streaming client for the Anthropic Messages API.
pub struct AnthropicClient {
    http: Client,
    api_key: SecretString,
    config: ClientConfig,
}

impl AnthropicClient {
    pub fn new(api_key: SecretString, config: ClientConfig) -> Result<Self, LlmError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Http(e.to_string()))?;
        Ok(Self {
            http,
            api_key,
            config,
        })
    }

    /// Build a client from settings, reading the key from the configured
    /// environment variable.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let key = std::env::var(&settings.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::MissingApiKey(settings.api_key_env.clone()))?;
        Self::new(SecretString::from(key), ClientConfig::from(settings))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start a streaming completion.
    #[instrument(skip_all, fields(model = %request.model))]
    pub async fn stream(&self, request: &CompletionRequest) -> Result<TextStream, GenerationError> {
        let body = RequestBody {
            model: &request.model,
            max_tokens: self.config.max_tokens,
            stream: true,
            system: request.system.as_deref(),
            messages: [RequestMessage {
                role: "user",
                content: &request.prompt,
            }],
        };

        let mut attempt = 0;
        let response = loop {
            match self.send_once(&body).await {
                Ok(response) => break response,
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let suggested = match &e {
                        GenerationError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = retry_delay(self.config.retry_base_delay, attempt, suggested);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying completion request");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        Ok(Box::pin(SseTextStream::with_idle_timeout(
            response.bytes_stream(),
            self.config.idle_timeout,
        )))
    }

    async fn send_once(&self, body: &RequestBody<'_>) -> Result<reqwest::Response, GenerationError> {
        let response = self
            .http
            .post(&self.config.api_url)
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("accept", "text/event-stream")
            .json(body)
            .send()
            .await
            .map_err(|e| GenerationError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(GenerationError::RateLimited { retry_after });
        }
        let body = response.text().await.unwrap_or_default();
        Err(GenerationError::from_status(status.as_u16(), body))
    }

    /// Run a completion to the end, calling `on_delta` for each text delta.
    /// Returns the full text.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        on_delta: &OnFragment<'_>,
    ) -> Result<String, GenerationError> {
        use futures::StreamExt;

        let mut stream = self.stream(request).await?;
        let mut text = String::new();
        while let Some(item) = stream.next().await {
            let delta = item?;
            on_delta(&delta);
            text.push_str(&delta);
        }
        Ok(text)
    }
}

/// `base * 2^(attempt-1)` plus up to 20% jitter, or the server's hint.
fn retry_delay(base: Duration, attempt: u32, suggested: Option<Duration>) -> Duration {
    if let Some(delay) = suggested {
        return delay;
    }
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter_ms = exp.as_millis() as u64 / 5;
    let jitter = if jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=jitter_ms)
    } else {
        0
    };
    exp + Duration::from_millis(jitter)
}

/// Adapts a reqwest byte stream into text deltas, with an idle timeout that
/// resets whenever bytes arrive.
struct SseTextStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: VecDeque<Result<String, GenerationError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseTextStream {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_events(&mut self, chunk: &str) {
        for (event_type, data) in sse::parse_sse_lines(chunk) {
            if self.finished {
                return;
            }
            match sse::interpret_event(&event_type, &data) {
                Some(SseEvent::TextDelta(text)) if !text.is_empty() => self.pending.push_back(Ok(text)),
                Some(SseEvent::Stop) => self.finished = true,
                Some(SseEvent::Error(data)) => {
                    self.pending.push_back(Err(sse::classify_error(&data)));
                    self.finished = true;
                }
                _ => {}
            }
        }
    }
}

impl Stream for SseTextStream {
    type Item = Result<String, GenerationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(item) = self.pending.pop_front() {
            return Poll::Ready(Some(item));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    let text = String::from_utf8_lossy(&bytes);
                    self.buffer.push_str(&text);

                    while let Some(pos) = self.buffer.find("\n\n") {
                        let chunk: String = self.buffer.drain(..pos + 2).collect();
                        self.drain_events(&chunk);
                    }

                    if let Some(item) = self.pending.pop_front() {
                        return Poll::Ready(Some(item));
                    }
                    if self.finished {
                        return Poll::Ready(None);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(GenerationError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    if !self.buffer.is_empty() {
                        let remaining = std::mem::take(&mut self.buffer);
                        self.drain_events(&remaining);
                    }
                    self.finished = true;
                    return Poll::Ready(self.pending.pop_front());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(GenerationError::Timeout(self.idle_duration))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
