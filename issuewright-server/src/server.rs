//! Process wiring: build every collaborator once from the frozen config and
//! serve the HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use issuewright_agents::AgentDeps;
use issuewright_agents::domain::{DomainContextProvider, StaticDomainContext};
use issuewright_agents::llm::LlmClient;
use issuewright_agents::store::{ConversationStore, SqliteStore};
use issuewright_agents::vcs::GitHubClient;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::orchestrator::Orchestrator;
use crate::web::{self, AppState};

const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Server {
    config: Arc<ServerConfig>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn build_state(&self) -> Result<Arc<AppState>> {
        let config = &self.config;
        config.validate()?;

        let store = SqliteStore::open(&config.db_path)
            .with_context(|| format!("opening database {}", config.db_path.display()))?;
        tracing::info!(path = %config.db_path.display(), "Database opened");

        let vcs = GitHubClient::new(&config.github_settings()).context("building GitHub client")?;
        let llm_settings = config.llm_settings();
        tracing::info!(
            provider = %llm_settings.provider,
            model = %llm_settings.model,
            "Reasoning backend configured"
        );
        let reasoner = LlmClient::new(llm_settings);

        let domain = match &config.domain_context {
            Some(path) => {
                let context = StaticDomainContext::load(path)
                    .with_context(|| format!("loading domain context {}", path.display()))?;
                tracing::info!(path = %path.display(), "Domain context loaded");
                context
            }
            None => StaticDomainContext::default(),
        };

        let retry = config.retry_policy();
        let deps = AgentDeps {
            reasoner: Arc::new(reasoner),
            vcs: Arc::new(vcs),
            store: Arc::new(store),
            domain: Arc::new(domain) as Arc<dyn DomainContextProvider>,
            reasoning_retry: retry,
            vcs_retry: retry,
        };
        let orchestrator = Orchestrator::new(
            deps,
            config.base_branch.clone(),
            config.orchestrator_settings(),
        );
        Ok(Arc::new(AppState {
            orchestrator,
            settings: config.gateway_settings(),
        }))
    }

    pub async fn run(self) -> Result<()> {
        let state = self.build_state()?;
        spawn_delivery_pruner(state.orchestrator.store().clone(), self.config.delivery_retention());

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("binding {}", self.config.listen_addr))?;
        tracing::info!(addr = %self.config.listen_addr, "Webhook listener ready");

        axum::serve(listener, web::router(state))
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        tracing::info!("Server stopped");
        Ok(())
    }

    /// Start the server and return the bound address + task handle (for testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let state = self.build_state()?;
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            axum::serve(listener, web::router(state)).await?;
            Ok(())
        });
        Ok((addr, handle))
    }
}

fn spawn_delivery_pruner(store: Arc<dyn ConversationStore>, retention: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            match store.prune_deliveries(retention).await {
                Ok(0) => {}
                Ok(pruned) => tracing::info!(pruned, "Pruned old delivery records"),
                Err(e) => tracing::warn!(error = %e, "Delivery pruning failed"),
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
