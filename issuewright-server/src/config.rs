//! Process configuration: parsed once at startup, then frozen.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use issuewright_agents::llm::{LlmProvider, LlmSettings};
use issuewright_agents::retry::RetryPolicy;
use issuewright_agents::vcs::GitHubSettings;

use crate::orchestrator::OrchestratorSettings;
use crate::web::GatewaySettings;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "issuewright-server",
    about = "Webhook-driven issue lifecycle orchestrator"
)]
pub struct ServerConfig {
    /// Address for the webhook HTTP listener
    #[arg(long, env = "ISSUEWRIGHT_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Shared secret used to sign webhook deliveries
    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", hide_env_values = true)]
    pub webhook_secret: String,

    /// GitHub token used for all API calls
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: String,

    #[arg(long, env = "GITHUB_API_URL", default_value = "https://api.github.com")]
    pub github_api_url: String,

    /// GitHub request timeout in seconds
    #[arg(long, env = "GITHUB_API_TIMEOUT", default_value_t = 30)]
    pub github_timeout_secs: u64,

    /// Branch pull requests are opened against
    #[arg(long, env = "ISSUEWRIGHT_BASE_BRANCH", default_value = "main")]
    pub base_branch: String,

    /// Login of the account this service posts as; its comments are ignored
    #[arg(long, env = "ISSUEWRIGHT_BOT_LOGIN")]
    pub bot_login: Option<String>,

    /// Repositories (owner/repo) to act on. Empty means all.
    #[arg(long = "repo", env = "ISSUEWRIGHT_REPOS", value_delimiter = ',')]
    pub repos: Vec<String>,

    /// SQLite database path
    #[arg(long, env = "ISSUEWRIGHT_DB", default_value = "issuewright.db")]
    pub db_path: PathBuf,

    /// Reasoning backend: anthropic, openai or ollama
    #[arg(long, env = "AI_PROVIDER", default_value = "anthropic")]
    pub ai_provider: LlmProvider,

    /// Model name (provider default if unset)
    #[arg(long, env = "AI_MODEL")]
    pub ai_model: Option<String>,

    #[arg(long, env = "AI_API_KEY", hide_env_values = true)]
    pub ai_api_key: Option<String>,

    /// Endpoint root override, e.g. a self-hosted Ollama
    #[arg(long, env = "AI_BASE_URL")]
    pub ai_base_url: Option<String>,

    #[arg(long, env = "AI_TEMPERATURE", default_value_t = 0.7)]
    pub ai_temperature: f32,

    #[arg(long, env = "AI_MAX_TOKENS", default_value_t = 2000)]
    pub ai_max_tokens: u32,

    /// Reasoning request timeout in seconds
    #[arg(long, env = "AI_TIMEOUT", default_value_t = 60)]
    pub ai_timeout_secs: u64,

    #[arg(long, env = "ISSUEWRIGHT_RETRY_MAX_ATTEMPTS", default_value_t = 3)]
    pub retry_max_attempts: u32,

    #[arg(long, env = "ISSUEWRIGHT_RETRY_INITIAL_DELAY_MS", default_value_t = 2000)]
    pub retry_initial_delay_ms: u64,

    #[arg(long, env = "ISSUEWRIGHT_RETRY_MAX_DELAY_MS", default_value_t = 10_000)]
    pub retry_max_delay_ms: u64,

    #[arg(long, env = "ISSUEWRIGHT_RETRY_MULTIPLIER", default_value_t = 2.0)]
    pub retry_multiplier: f64,

    /// Clarification rounds before an issue is handed to a human
    #[arg(long, env = "ISSUEWRIGHT_MAX_CLARIFICATION_TURNS", default_value_t = 5)]
    pub max_clarification_turns: u32,

    /// How long a delivery may hold a conversation lease, in seconds
    #[arg(long, env = "ISSUEWRIGHT_LEASE_TTL", default_value_t = 600)]
    pub lease_ttl_secs: u64,

    /// How long a delivery waits for a busy conversation, in seconds
    #[arg(long, env = "ISSUEWRIGHT_LEASE_WAIT", default_value_t = 30)]
    pub lease_wait_secs: u64,

    /// Upper bound on handling one delivery, in seconds
    #[arg(long, env = "ISSUEWRIGHT_HANDLER_TIMEOUT", default_value_t = 540)]
    pub handler_timeout_secs: u64,

    /// How long finished delivery ids are remembered, in hours
    #[arg(long, env = "ISSUEWRIGHT_DELIVERY_RETENTION_HOURS", default_value_t = 72)]
    pub delivery_retention_hours: u64,

    /// TOML file with domain context for the agents
    #[arg(long, env = "ISSUEWRIGHT_DOMAIN_CONTEXT")]
    pub domain_context: Option<PathBuf>,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.webhook_secret.trim().is_empty() {
            bail!("webhook secret must not be empty");
        }
        if self.github_token.trim().is_empty() {
            bail!("GitHub token must not be empty");
        }
        for repo in &self.repos {
            if !is_repo_slug(repo) {
                bail!("invalid repository {repo:?}, expected owner/repo");
            }
        }
        if self.ai_provider != LlmProvider::Ollama && self.ai_api_key.is_none() {
            bail!("an API key is required for the {} provider", self.ai_provider);
        }
        if self.retry_max_attempts < 1 {
            bail!("retry max attempts must be at least 1");
        }
        if !(self.retry_multiplier >= 1.0) {
            bail!("retry multiplier must be >= 1");
        }
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            bail!("retry initial delay exceeds max delay");
        }
        if self.max_clarification_turns < 1 {
            bail!("max clarification turns must be at least 1");
        }
        if self.lease_ttl_secs == 0 || self.handler_timeout_secs == 0 {
            bail!("lease TTL and handler timeout must be positive");
        }
        if self.lease_ttl_secs < self.handler_timeout_secs {
            tracing::warn!(
                lease_ttl_secs = self.lease_ttl_secs,
                handler_timeout_secs = self.handler_timeout_secs,
                "Lease TTL is shorter than the handler timeout; \
                 long deliveries will fall back to version checks"
            );
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
        }
    }

    pub fn llm_settings(&self) -> LlmSettings {
        let mut settings = LlmSettings::new(self.ai_provider);
        if let Some(model) = &self.ai_model {
            settings.model = model.clone();
        }
        settings.api_key = self.ai_api_key.clone();
        settings.base_url = self.ai_base_url.clone();
        settings.temperature = self.ai_temperature;
        settings.max_tokens = self.ai_max_tokens;
        settings.timeout = Duration::from_secs(self.ai_timeout_secs);
        settings
    }

    pub fn github_settings(&self) -> GitHubSettings {
        GitHubSettings {
            token: self.github_token.clone(),
            api_base: self.github_api_url.clone(),
            timeout: Duration::from_secs(self.github_timeout_secs),
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_clarification_turns: self.max_clarification_turns,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            lease_wait: Duration::from_secs(self.lease_wait_secs),
            bot_login: self.bot_login.clone(),
            repos: self.repos.clone(),
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            webhook_secret: self.webhook_secret.clone(),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
        }
    }

    pub fn delivery_retention(&self) -> Duration {
        Duration::from_secs(self.delivery_retention_hours * 3600)
    }
}

/// `owner/repo` with no empty parts and no whitespace.
pub fn is_repo_slug(s: &str) -> bool {
    let mut parts = s.split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => {
            !owner.is_empty()
                && !name.is_empty()
                && !s.chars().any(char::is_whitespace)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut argv = vec![
            "issuewright-server",
            "--webhook-secret",
            "s3cret",
            "--github-token",
            "ghp_test",
            "--ai-api-key",
            "sk-test",
        ];
        argv.extend_from_slice(args);
        ServerConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_are_valid() {
        let config = parse(&[]);
        config.validate().unwrap();
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.max_clarification_turns, 5);
        assert_eq!(config.ai_provider, LlmProvider::Anthropic);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(10));

        let llm = config.llm_settings();
        assert_eq!(llm.max_tokens, 2000);
        assert_eq!(llm.timeout, Duration::from_secs(60));
    }

    #[test]
    fn repo_list_is_comma_separated_and_validated() {
        let config = parse(&["--repo", "acme/shop,acme/api"]);
        assert_eq!(config.repos, vec!["acme/shop", "acme/api"]);
        config.validate().unwrap();

        let config = parse(&["--repo", "acme"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_retry_settings() {
        assert!(parse(&["--retry-multiplier", "0.5"]).validate().is_err());
        assert!(parse(&["--retry-max-attempts", "0"]).validate().is_err());
        assert!(parse(&["--max-clarification-turns", "0"]).validate().is_err());
    }

    #[test]
    fn unknown_provider_fails_to_parse() {
        let argv = [
            "issuewright-server",
            "--webhook-secret",
            "s",
            "--github-token",
            "t",
            "--ai-provider",
            "gemini",
        ];
        assert!(ServerConfig::try_parse_from(argv).is_err());
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = ServerConfig::try_parse_from([
            "issuewright-server",
            "--webhook-secret",
            "s",
            "--github-token",
            "t",
            "--ai-provider",
            "ollama",
        ])
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.llm_settings().model, "llama3.1");
    }

    #[test]
    fn slugs() {
        assert!(is_repo_slug("acme/shop"));
        assert!(!is_repo_slug("acme/"));
        assert!(!is_repo_slug("acme/shop/x"));
        assert!(!is_repo_slug("ac me/shop"));
    }
}
