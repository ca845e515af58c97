use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs in production (ISSUEWRIGHT_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("ISSUEWRIGHT_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("issuewright_server=info".parse()?)
        .add_directive("issuewright_agents=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = issuewright_server::config::ServerConfig::parse();
    tracing::info!(
        listen_addr = %config.listen_addr,
        repos = ?config.repos,
        "Starting issuewright"
    );
    let server = issuewright_server::server::Server::new(config);
    server.run().await
}
