//! Reasoning collaborator: one structured prompt in, text out.
//!
//! Backends are interchangeable behind [`Reasoner`]. [`LlmClient`] speaks the
//! Anthropic Messages API, OpenAI Chat Completions, and Ollama through its
//! OpenAI-compatible endpoint.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result, Service};

/// A single-turn prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
        }
    }
}

/// Takes structured input, returns text that should parse. May fail or time out.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn invoke(&self, prompt: &Prompt) -> Result<String>;

    /// Short backend identifier for logs.
    fn name(&self) -> &str {
        "reasoner"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
    OpenAi,
    Ollama,
}

impl LlmProvider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "https://api.anthropic.com/v1",
            LlmProvider::OpenAi => "https://api.openai.com/v1",
            LlmProvider::Ollama => "http://localhost:11434/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Anthropic => "claude-sonnet-4-20250514",
            LlmProvider::OpenAi => "gpt-4o",
            LlmProvider::Ollama => "llama3.1",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmProvider::Anthropic => write!(f, "anthropic"),
            LlmProvider::OpenAi => write!(f, "openai"),
            LlmProvider::Ollama => write!(f, "ollama"),
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(LlmProvider::Anthropic),
            "openai" => Ok(LlmProvider::OpenAi),
            "ollama" => Ok(LlmProvider::Ollama),
            other => Err(format!(
                "unknown reasoning provider '{other}' (expected anthropic, openai or ollama)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: Option<String>,
    /// Overrides the provider's default endpoint root.
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl LlmSettings {
    pub fn new(provider: LlmProvider) -> Self {
        Self {
            provider,
            model: provider.default_model().to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.7,
            max_tokens: 2000,
            timeout: Duration::from_secs(60),
        }
    }
}

/// HTTP reasoning client.
pub struct LlmClient {
    settings: LlmSettings,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
        }
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    fn endpoint(&self, path: &str) -> String {
        let base = self
            .settings
            .base_url
            .as_deref()
            .unwrap_or_else(|| self.settings.provider.default_base_url());
        format!("{}/{}", base.trim_end_matches('/'), path)
    }

    async fn anthropic(&self, prompt: &Prompt) -> Result<String> {
        let body = serde_json::json!({
            "model": &self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "system": &prompt.system,
            "messages": [{ "role": "user", "content": &prompt.user }],
        });

        let mut req = self
            .http
            .post(self.endpoint("messages"))
            .timeout(self.settings.timeout)
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.settings.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let parsed: MessagesResponse = resp.json().await.map_err(decode_error)?;
        Ok(parsed.text())
    }

    async fn chat_completions(&self, prompt: &Prompt) -> Result<String> {
        let body = serde_json::json!({
            "model": &self.settings.model,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
            "messages": [
                { "role": "system", "content": &prompt.system },
                { "role": "user", "content": &prompt.user },
            ],
        });

        let mut req = self
            .http
            .post(self.endpoint("chat/completions"))
            .timeout(self.settings.timeout)
            .json(&body);
        if let Some(key) = &self.settings.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let resp = check_status(resp).await?;
        let parsed: ChatResponse = resp.json().await.map_err(decode_error)?;
        parsed.text()
    }
}

#[async_trait]
impl Reasoner for LlmClient {
    async fn invoke(&self, prompt: &Prompt) -> Result<String> {
        tracing::debug!(
            provider = %self.settings.provider,
            model = %self.settings.model,
            "Invoking reasoning backend"
        );
        match self.settings.provider {
            LlmProvider::Anthropic => self.anthropic(prompt).await,
            LlmProvider::OpenAi | LlmProvider::Ollama => self.chat_completions(prompt).await,
        }
    }

    fn name(&self) -> &str {
        match self.settings.provider {
            LlmProvider::Anthropic => "anthropic",
            LlmProvider::OpenAi => "openai",
            LlmProvider::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

impl MessagesResponse {
    fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn text(self) -> Result<String> {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::Provider {
                status: 200,
                message: "response contained no choices".into(),
            })
    }
}

/// Whether an HTTP status from a reasoning backend is worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..600).contains(&status)
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), &body))
}

fn status_error(status: u16, body: &str) -> Error {
    let message = crate::error::excerpt(body, 300);
    if is_transient_status(status) {
        Error::transient(Service::Reasoning, format!("HTTP {status}: {message}"))
    } else {
        Error::Provider { status, message }
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::transient(Service::Reasoning, format!("request timed out: {err}"));
    }
    Error::transient(Service::Reasoning, format!("request failed: {err}"))
}

fn decode_error(err: reqwest::Error) -> Error {
    Error::Provider {
        status: 200,
        message: format!("unreadable response body: {err}"),
    }
}
