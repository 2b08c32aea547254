use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "deepseek/deepseek-chat-v3.1:free";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Process-wide settings, loaded once in `main` and handed to every component.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Request timeout in seconds
    pub timeout: u64,
    pub max_retries: u32,
    /// Base backoff delay in seconds, doubled on every retry
    pub retry_delay: f64,
    /// Minimum spacing between two requests, in seconds
    pub min_request_interval: f64,
    /// Pause between two batch items, in seconds
    pub item_delay: f64,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
    pub prompts_file: Option<PathBuf>,
    pub app_title: String,
    pub http_referer: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.1,
            max_tokens: 2000,
            timeout: 30,
            max_retries: 3,
            retry_delay: 1.0,
            min_request_interval: 1.0,
            item_delay: 2.0,
            output_dir: PathBuf::from("outputs"),
            data_dir: PathBuf::from("data"),
            prompts_file: None,
            app_title: "Risk Analysis System".to_string(),
            http_referer: "http://localhost:10808".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the process environment (call `dotenv` first).
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Config::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        cfg.api_key = get("OPENROUTER_API_KEY").ok_or(ConfigError::Missing("OPENROUTER_API_KEY"))?;
        if let Some(v) = get("LLM_BASE_URL") {
            cfg.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("DEFAULT_MODEL") {
            cfg.model = v;
        }
        if let Some(v) = get("LLM_TEMPERATURE") {
            cfg.temperature = parse("LLM_TEMPERATURE", &v)?;
        }
        if let Some(v) = get("LLM_MAX_TOKENS") {
            cfg.max_tokens = parse("LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("API_TIMEOUT") {
            cfg.timeout = parse("API_TIMEOUT", &v)?;
        }
        if let Some(v) = get("MAX_RETRIES") {
            cfg.max_retries = parse("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_DELAY") {
            cfg.retry_delay = parse("RETRY_DELAY", &v)?;
        }
        if let Some(v) = get("MIN_REQUEST_INTERVAL") {
            cfg.min_request_interval = parse("MIN_REQUEST_INTERVAL", &v)?;
        }
        if let Some(v) = get("ITEM_DELAY") {
            cfg.item_delay = parse("ITEM_DELAY", &v)?;
        }
        if let Some(v) = get("OUTPUT_DIR") {
            cfg.output_dir = PathBuf::from(v);
        }
        if let Some(v) = get("DATA_DIR") {
            cfg.data_dir = PathBuf::from(v);
        }
        cfg.prompts_file = get("PROMPTS_FILE").map(PathBuf::from);
        if let Some(v) = get("APP_TITLE") {
            cfg.app_title = v;
        }
        if let Some(v) = get("HTTP_REFERER") {
            cfg.http_referer = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("OPENROUTER_API_KEY"));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid { key: "LLM_BASE_URL", value: self.base_url.clone() });
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid { key: "DEFAULT_MODEL", value: self.model.clone() });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid {
                key: "LLM_TEMPERATURE",
                value: self.temperature.to_string(),
            });
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid { key: "LLM_MAX_TOKENS", value: "0".into() });
        }
        if self.timeout == 0 {
            return Err(ConfigError::Invalid { key: "API_TIMEOUT", value: "0".into() });
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid { key: "MAX_RETRIES", value: "0".into() });
        }
        for (key, value) in [
            ("RETRY_DELAY", self.retry_delay),
            ("MIN_REQUEST_INTERVAL", self.min_request_interval),
            ("ITEM_DELAY", self.item_delay),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid { key, value: value.to_string() });
            }
        }
        Ok(())
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_secs_f64(self.item_delay)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid { key, value: value.to_string() })
}
