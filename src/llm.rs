use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::Config;

const MAX_JITTER_MS: u64 = 250;

/// Error types for chat-completion calls
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("server busy ({status})")]
    ServerBusy { status: u16 },

    #[error("network connection failed: {message}")]
    Network { message: String },

    #[error("request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("response contained no content")]
    EmptyResponse,

    #[error("failed to parse response: {message}")]
    Parse { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<LlmError> },
}

impl LlmError {
    /// Transient failures worth another attempt with backoff. Client errors other than
    /// 408 are terminal: resending the same request cannot succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited
            | LlmError::ServerBusy { .. }
            | LlmError::Network { .. }
            | LlmError::Timeout { .. } => true,
            LlmError::Api { status, .. } => {
                *status == StatusCode::REQUEST_TIMEOUT.as_u16() || !(400..500).contains(status)
            }
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LlmError::RateLimited)
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            LlmError::RateLimited => {
                "🚫 Rate limit exceeded. Please wait a moment before trying again.".to_string()
            }
            LlmError::ServerBusy { .. } => {
                "🚫 The model service is busy. Please try again in a few moments.".to_string()
            }
            LlmError::Network { .. } => {
                "🌐 Network connection failed. Please check your internet connection and try again."
                    .to_string()
            }
            LlmError::Timeout { seconds } => {
                format!(
                    "⏰ Request timed out after {} seconds. The server might be overloaded.",
                    seconds
                )
            }
            LlmError::Auth { .. } => {
                "🔑 Authentication failed. Check OPENROUTER_API_KEY.".to_string()
            }
            LlmError::Api { status, .. } if !self.is_retryable() => {
                format!("❌ The API rejected the request ({}).", status)
            }
            LlmError::Api { status, .. } => format!("❌ API error ({}). Please try again later.", status),
            LlmError::EmptyResponse | LlmError::Parse { .. } => {
                "⚠️ The model returned an unusable response.".to_string()
            }
            LlmError::Config { message } => format!("⚙️ Configuration error: {}", message),
            LlmError::Exhausted { attempts, last } => {
                format!("{} (after {} attempts)", last.user_message(), attempts)
            }
        }
    }
}

/// Per-call knobs; defaults come from [`Config`].
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: u64,
    pub max_retries: u32,
    pub retry_delay: f64,
    pub json_response: bool,
}

impl CallOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            json_response: false,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: f64) -> Self {
        self.max_retries = max_retries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    pub fn json(mut self) -> Self {
        self.json_response = true;
        self
    }

    /// Wait before retry number `attempt + 1` (attempt is zero-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(16) as i32);
        Duration::from_secs_f64(self.retry_delay * factor)
    }
}

/// Anything that turns a prompt into model text.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        options: &CallOptions,
    ) -> Result<String, LlmError>;

    fn model_info(&self) -> String;
}

/// Courtesy throttle: consecutive requests start at least `min_interval` apart.
#[derive(Debug, Clone)]
pub struct RequestGate {
    min_interval: Duration,
    last: Arc<Mutex<Option<Instant>>>,
}

impl RequestGate {
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, last: Arc::new(Mutex::new(None)) }
    }

    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let pause = self.min_interval - elapsed;
                debug!("rate gate: sleeping {:?} before next request", pause);
                tokio::time::sleep(pause).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// API request/response structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".to_string(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// OpenAI-compatible chat-completion client (OpenRouter by default)
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: Config,
    gate: RequestGate,
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("base_url", &self.config.base_url)
            .field("model", &self.config.model)
            .finish()
    }
}

impl LlmClient {
    pub fn new(config: Config) -> Result<Self, LlmError> {
        config.validate().map_err(|e| LlmError::Config { message: e.to_string() })?;

        let client = Client::builder()
            .user_agent("risk_agents/0.1.0")
            .build()
            .map_err(|e| LlmError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let gate = RequestGate::new(Duration::from_secs_f64(config.min_request_interval));
        Ok(Self { client, config, gate })
    }

    pub fn default_options(&self) -> CallOptions {
        CallOptions::from_config(&self.config)
    }

    /// Send chat messages with the retry policy applied.
    pub async fn send_messages(
        &self,
        messages: Vec<ChatMessage>,
        options: &CallOptions,
    ) -> Result<String, LlmError> {
        let max_attempts = options.max_retries.max(1);
        let mut attempt = 0;

        loop {
            self.gate.wait().await;
            info!(
                "LLM request attempt {}/{} (model {})",
                attempt + 1,
                max_attempts,
                self.config.model
            );

            let err = match self.send_messages_raw(messages.clone(), options).await {
                Ok(content) => {
                    info!("LLM request succeeded on attempt {}", attempt + 1);
                    return Ok(content);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                error!("LLM request failed with a terminal error: {}", err);
                return Err(err);
            }

            attempt += 1;
            if attempt >= max_attempts {
                error!("LLM request failed after {} attempts: {}", attempt, err);
                return Err(LlmError::Exhausted { attempts: attempt, last: Box::new(err) });
            }

            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
            let wait = options.backoff(attempt - 1) + jitter;
            if err.is_rate_limited() {
                warn!("rate limited (attempt {}/{}), retrying in {:?}", attempt, max_attempts, wait);
            } else {
                warn!(
                    "LLM request attempt {}/{} failed: {}, retrying in {:?}",
                    attempt, max_attempts, err, wait
                );
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// One HTTP round trip; returns the first choice's content.
    pub async fn send_messages_raw(
        &self,
        messages: Vec<ChatMessage>,
        options: &CallOptions,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            response_format: options
                .json_response
                .then(|| ResponseFormat { format_type: "json_object".to_string() }),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("HTTP-Referer", &self.config.http_referer)
            .header("X-Title", &self.config.app_title)
            .timeout(Duration::from_secs(options.timeout))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e, options.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.handle_error_response(status, response).await);
        }

        let api_response: ApiResponse = response.json().await.map_err(|e| LlmError::Parse {
            message: format!("Failed to parse API response: {}", e),
        })?;

        api_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    /// Map reqwest errors to our custom error types
    fn map_reqwest_error(&self, error: reqwest::Error, timeout: u64) -> LlmError {
        if error.is_timeout() {
            return LlmError::Timeout { seconds: timeout };
        }

        if error.is_connect() {
            return LlmError::Network { message: "Failed to connect to server".to_string() };
        }

        let error_msg = error.to_string().to_lowercase();
        if error_msg.contains("dns") {
            return LlmError::Network { message: "DNS resolution failed".to_string() };
        }

        LlmError::Network { message: format!("Request error: {}", error) }
    }

    /// Handle error responses from the server
    async fn handle_error_response(
        &self,
        status: StatusCode,
        response: reqwest::Response,
    ) -> LlmError {
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        match status {
            StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                LlmError::Auth { status: status.as_u16(), message: error_text }
            }
            StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::BAD_GATEWAY
            | StatusCode::GATEWAY_TIMEOUT
            | StatusCode::INTERNAL_SERVER_ERROR => LlmError::ServerBusy { status: status.as_u16() },
            _ => LlmError::Api { status: status.as_u16(), message: error_text },
        }
    }
}

#[async_trait]
impl Completion for LlmClient {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        options: &CallOptions,
    ) -> Result<String, LlmError> {
        self.send_messages(vec![ChatMessage::system(system), ChatMessage::user(prompt)], options)
            .await
    }

    fn model_info(&self) -> String {
        format!("LlmClient({})", self.config.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(LlmError::RateLimited.is_retryable());
        assert!(LlmError::Timeout { seconds: 30 }.is_retryable());
        assert!(LlmError::ServerBusy { status: 503 }.is_retryable());
        let api = |status| LlmError::Api { status, message: String::new() };
        assert!(!api(400).is_retryable());
        assert!(!api(404).is_retryable());
        assert!(!api(422).is_retryable());
        assert!(api(408).is_retryable());
        assert!(api(520).is_retryable());
        assert!(api(404).user_message().contains("rejected"));
        assert!(!LlmError::Auth { status: 401, message: String::new() }.is_retryable());
        assert!(!LlmError::EmptyResponse.is_retryable());
        assert!(!LlmError::Parse { message: String::new() }.is_retryable());
    }

    #[test]
    fn backoff_doubles() {
        let opts = CallOptions::from_config(&Config::default()).with_retries(5, 3.0);
        assert_eq!(opts.backoff(0), Duration::from_secs(3));
        assert_eq!(opts.backoff(1), Duration::from_secs(6));
        assert_eq!(opts.backoff(2), Duration::from_secs(12));
    }

    #[test]
    fn exhausted_message_mentions_attempts() {
        let err = LlmError::Exhausted { attempts: 3, last: Box::new(LlmError::RateLimited) };
        assert!(err.to_string().contains("3 attempts"));
        assert!(err.user_message().contains("after 3 attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_spaces_consecutive_requests() {
        let gate = RequestGate::new(Duration::from_secs(2));
        let start = Instant::now();
        gate.wait().await;
        assert!(start.elapsed() < Duration::from_millis(10));
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
        gate.wait().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn gate_does_not_sleep_after_long_idle() {
        let gate = RequestGate::new(Duration::from_secs(1));
        gate.wait().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let before = Instant::now();
        gate.wait().await;
        assert!(before.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn client_rejects_invalid_config() {
        let err = LlmClient::new(Config::default()).unwrap_err();
        assert!(matches!(err, LlmError::Config { .. }));
    }
}
